//! TLS listener setup
//!
//! Loads the PEM certificate chain and private key named in the config and
//! builds the acceptor the listener wraps every accepted socket with. No
//! client authentication; clients are identified by source address.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;

use crate::error::{Error, Result};

/// Build a TLS acceptor from PEM files on disk.
pub fn build_acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor> {
    let mut cert_reader = BufReader::new(File::open(cert_file).map_err(|e| {
        Error::Tls(format!("opening certificate {}: {e}", cert_file.display()))
    })?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("reading certificate {}: {e}", cert_file.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            cert_file.display()
        )));
    }

    let mut key_reader = BufReader::new(File::open(key_file).map_err(|e| {
        Error::Tls(format!("opening private key {}: {e}", key_file.display()))
    })?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| Error::Tls(format!("reading private key {}: {e}", key_file.display())))?
        .ok_or_else(|| {
            Error::Tls(format!("no private key found in {}", key_file.display()))
        })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("building server TLS config: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_cert_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = build_acceptor(
            &dir.path().join("absent.crt"),
            &dir.path().join("absent.key"),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("opening certificate"), "{err}");
    }

    #[test]
    fn empty_pem_errors() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("empty.crt");
        let key_path = dir.path().join("empty.key");
        File::create(&cert_path).unwrap();
        File::create(&key_path).unwrap();

        let err = build_acceptor(&cert_path, &key_path).err().unwrap();
        assert!(err.to_string().contains("no certificates"), "{err}");
    }

    #[test]
    fn garbage_key_errors() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("some.crt");
        let key_path = dir.path().join("some.key");
        // A syntactically valid but meaningless certificate block gets past
        // the PEM reader; the key file is what fails here.
        let mut cert = File::create(&cert_path).unwrap();
        writeln!(cert, "-----BEGIN CERTIFICATE-----").unwrap();
        writeln!(cert, "AAAA").unwrap();
        writeln!(cert, "-----END CERTIFICATE-----").unwrap();
        File::create(&key_path).unwrap();

        let err = build_acceptor(&cert_path, &key_path).err().unwrap();
        assert!(err.to_string().contains("private key"), "{err}");
    }
}
