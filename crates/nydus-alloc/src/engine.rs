//! Allocation engine
//!
//! Owns the in-memory pool and its backing file. The pool is an ordered list
//! of records; order is insertion order and never changes, so the free-slot
//! scan is deterministic. Every mutating operation rewrites the whole file
//! atomically (temp file in the same directory, fsync, rename) before it
//! returns. The caller holds one writer lock around each operation; the
//! engine itself is single-threaded.
//!
//! A save failure leaves memory and disk diverged, which is why it is
//! `Error::Storage` and fatal to the process.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use common::is_valid_field;
use nydus_auth::AuthBundle;

use crate::error::{Error, Result};
use crate::record::AllocRecord;
use crate::sessions::SessionTable;

/// How long a tenancy may stand before maintenance releases it.
pub const ALLOC_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// The in-memory pool and its backing file.
pub struct AllocEngine {
    path: PathBuf,
    records: Vec<AllocRecord>,
}

impl AllocEngine {
    /// Load the pool from `path`.
    ///
    /// A missing or empty file is the cold-start case and yields an empty
    /// pool. Otherwise the first line must be the expected header and every
    /// further line must parse as a record; any malformed line is fatal.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "pool file not found, starting with an empty pool");
                return Ok(Self {
                    path,
                    records: Vec::new(),
                });
            }
            Err(e) => {
                return Err(Error::Storage(format!(
                    "reading pool file {}: {e}",
                    path.display()
                )));
            }
        };

        if contents.trim().is_empty() {
            info!(path = %path.display(), "pool file is empty, starting with an empty pool");
            return Ok(Self {
                path,
                records: Vec::new(),
            });
        }

        let mut lines = contents.lines();
        let header = lines.next().unwrap_or_default().trim_end();
        if header != AllocRecord::header() {
            return Err(Error::Parse(format!(
                "pool file header does not match the schema: {header:?}"
            )));
        }

        let mut records = Vec::new();
        for (idx, line) in lines.enumerate() {
            let record = AllocRecord::from_line(line)
                .map_err(|e| Error::Parse(format!("line {}: {e}", idx + 2)))?;
            records.push(record);
        }

        let mut seen_uuids: HashSet<&str> = HashSet::new();
        let mut seen_addrs: HashSet<Ipv4Addr> = HashSet::new();
        for record in &records {
            if !seen_uuids.insert(record.uuid()) {
                // Duplicates are acted on in full by the uuid operations;
                // flag them so the operator can clean up.
                warn!(uuid = record.uuid(), "duplicate game uuid in pool file");
            }
            if let Some(tenancy) = record.tenancy() {
                if !seen_addrs.insert(tenancy.client_addr()) {
                    warn!(
                        client = %tenancy.client_addr(),
                        uuid = record.uuid(),
                        "multiple allocated records share a client address in pool file"
                    );
                }
            }
        }

        info!(path = %path.display(), records = records.len(), "loaded allocation pool");
        Ok(Self { path, records })
    }

    /// Rewrite the backing file to match the in-memory pool.
    pub async fn save(&self) -> Result<()> {
        write_atomic(&self.path, &render_listing(&self.records)).await?;
        debug!(path = %self.path.display(), records = self.records.len(), "persisted allocation pool");
        Ok(())
    }

    /// Allocate a free account to `(client_addr, client_user)`.
    ///
    /// First releases every record the client already holds, so a client can
    /// never end up with two tenancies, then takes the first record in
    /// insertion order that was free before this call. Records released by
    /// this call are excluded from the scan; a repeat request swaps the
    /// client onto a different account instead of handing the same one back.
    /// Returns a detached copy of the allocated record, or `None` when the
    /// pool has no such record.
    pub async fn allocate(
        &mut self,
        client_addr: Ipv4Addr,
        client_user: &str,
    ) -> Result<Option<AllocRecord>> {
        // Pick the slot before the release sweep: anything freed below
        // belonged to this client and must not be chosen.
        let slot = self.records.iter().position(|r| !r.is_allocated());

        let released = self.release_matching(|r| {
            r.tenancy().map(|t| t.client_addr()) == Some(client_addr)
        });
        if released > 0 {
            debug!(client = %client_addr, released, "released prior tenancies before allocating");
        }

        let allocated = match slot {
            Some(idx) => {
                let record = &mut self.records[idx];
                record.allocate(client_addr, client_user)?;
                info!(
                    client = %client_addr,
                    user = client_user,
                    uuid = record.uuid(),
                    "allocated account"
                );
                metrics::counter!("nydus_allocations_total").increment(1);
                Some(record.clone())
            }
            None => {
                info!(client = %client_addr, user = client_user, "no free account in pool");
                metrics::counter!("nydus_allocation_misses_total").increment(1);
                None
            }
        };

        if released > 0 || allocated.is_some() {
            self.save().await?;
        }
        Ok(allocated)
    }

    /// Force-allocate every record with this game UUID to the given client,
    /// overwriting existing tenancies. Administrative override; duplicate
    /// UUIDs mean more than one record changes hands.
    pub async fn allocate_by_uuid(
        &mut self,
        uuid: &str,
        client_addr: Ipv4Addr,
        client_user: &str,
    ) -> Result<usize> {
        check_uuid(uuid)?;
        let mut count = 0;
        for record in self.records.iter_mut().filter(|r| r.uuid() == uuid) {
            record.allocate(client_addr, client_user)?;
            count += 1;
        }
        if count > 0 {
            info!(uuid, client = %client_addr, user = client_user, count, "forced allocation");
            self.save().await?;
        }
        Ok(count)
    }

    /// Release every allocated record with this game UUID.
    pub async fn release_by_uuid(&mut self, uuid: &str) -> Result<usize> {
        check_uuid(uuid)?;
        let released = self.release_matching(|r| r.uuid() == uuid);
        if released > 0 {
            info!(uuid, released, "released by uuid");
            self.save().await?;
        }
        Ok(released)
    }

    /// Release every record allocated to this client address.
    pub async fn release_by_addr(&mut self, client_addr: Ipv4Addr) -> Result<usize> {
        let released = self.release_matching(|r| {
            r.tenancy().map(|t| t.client_addr()) == Some(client_addr)
        });
        if released > 0 {
            info!(client = %client_addr, released, "released by client address");
            self.save().await?;
        }
        Ok(released)
    }

    /// Release every record whose tenancy is older than `limit`.
    pub async fn release_expired(&mut self, limit: Duration) -> Result<usize> {
        let released = self.release_matching(|r| r.tenancy_expired(limit));
        if released > 0 {
            info!(released, "released expired tenancies");
            self.save().await?;
        }
        Ok(released)
    }

    /// Release every allocated record whose `(user, addr)` tenancy has no
    /// live session in the probe result.
    pub async fn release_absent(&mut self, sessions: &SessionTable) -> Result<usize> {
        let released = self.release_matching(|r| match r.tenancy() {
            Some(t) => sessions
                .sessions_for(t.client_user(), t.client_addr())
                .is_empty(),
            None => false,
        });
        if released > 0 {
            info!(released, "released tenancies with no live session");
            self.save().await?;
        }
        Ok(released)
    }

    /// Detached copies of every record, in pool order.
    pub fn view_all(&self) -> Vec<AllocRecord> {
        self.records.clone()
    }

    /// Detached copies of every record with this game UUID.
    pub fn view_by_uuid(&self, uuid: &str) -> Vec<AllocRecord> {
        self.records
            .iter()
            .filter(|r| r.uuid() == uuid)
            .cloned()
            .collect()
    }

    /// Detached copies of every record allocated to this client address.
    pub fn view_by_addr(&self, client_addr: Ipv4Addr) -> Vec<AllocRecord> {
        self.records
            .iter()
            .filter(|r| r.tenancy().map(|t| t.client_addr()) == Some(client_addr))
            .cloned()
            .collect()
    }

    /// Replace the pool with free records around the given bundles and
    /// persist it. Initial population, used when the file held nothing.
    pub async fn create(&mut self, bundles: Vec<AuthBundle>) -> Result<()> {
        self.records = bundles.into_iter().map(AllocRecord::new_free).collect();
        info!(records = self.records.len(), "created allocation pool");
        self.save().await
    }

    /// Swap in fresh bundles for records whose upstream username has one.
    /// Tenancies are untouched. Startup path for a non-empty pool file.
    pub async fn refresh_from_bundles(
        &mut self,
        bundles: &HashMap<String, AuthBundle>,
    ) -> Result<usize> {
        let mut refreshed = 0;
        for record in &mut self.records {
            if let Some(bundle) = bundles.get(record.bundle().ms_username()) {
                *record.bundle_mut() = bundle.clone();
                refreshed += 1;
            }
        }
        if refreshed > 0 {
            info!(refreshed, "refreshed pool bundles from new authentication");
            self.save().await?;
        }
        Ok(refreshed)
    }

    pub fn count_total(&self) -> usize {
        self.records.len()
    }

    /// Mutable access for maintenance token renewal. The caller owns the
    /// follow-up `save()`.
    pub fn records_mut(&mut self) -> &mut [AllocRecord] {
        &mut self.records
    }

    fn release_matching(&mut self, mut matches: impl FnMut(&AllocRecord) -> bool) -> usize {
        let mut released = 0;
        for record in self.records.iter_mut().filter(|r| r.is_allocated()) {
            if matches(record) {
                record.release();
                released += 1;
            }
        }
        if released > 0 {
            metrics::counter!("nydus_releases_total").increment(released as u64);
        }
        released
    }
}

/// Render records in the pool-file shape (header plus one line each), which
/// is also how the administrative view commands print them.
pub fn render_listing(records: &[AllocRecord]) -> String {
    let mut out = String::new();
    out.push_str(&AllocRecord::header());
    out.push('\n');
    for record in records {
        out.push_str(&record.to_line());
        out.push('\n');
    }
    out
}

fn check_uuid(uuid: &str) -> Result<()> {
    if is_valid_field(uuid) {
        Ok(())
    } else {
        Err(Error::Policy(format!("not a usable game uuid: {uuid:?}")))
    }
}

/// Write the rendered pool to a sibling temp file, fsync, and rename it over
/// the original.
async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Storage("pool file path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(".nydus-alloc.tmp.{}", std::process::id()));

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| Error::Storage(format!("creating temp pool file: {e}")))?;
    file.write_all(contents.as_bytes())
        .await
        .map_err(|e| Error::Storage(format!("writing temp pool file: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Storage(format!("syncing temp pool file: {e}")))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Storage(format!("renaming temp pool file: {e}")))
}
