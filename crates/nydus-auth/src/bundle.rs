//! Per-account token bundle
//!
//! Everything one upstream account needs for a game launch: the four chained
//! tokens plus the issued game profile. The profile echoes the game-stage
//! token, so the game-token setter rewrites both fields together.

use common::{is_valid_field, is_valid_ms_username};

use crate::error::{Error, Result};
use crate::token::AccessToken;

/// Game identity issued at the end of the chain.
///
/// `token` repeats the game-stage bearer token; the launcher consumes the
/// three fields as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McProfile {
    name: String,
    uuid: String,
    token: String,
}

impl McProfile {
    pub fn new(
        name: impl Into<String>,
        uuid: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let uuid = uuid.into();
        let token = token.into();
        if !is_valid_field(&name) {
            return Err(Error::InvalidValue(format!("invalid profile name: {name:?}")));
        }
        if !is_valid_field(&uuid) {
            return Err(Error::InvalidValue(format!("invalid profile uuid: {uuid:?}")));
        }
        if !is_valid_field(&token) {
            return Err(Error::InvalidValue("invalid profile token".into()));
        }
        Ok(Self { name, uuid, token })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// The four chained tokens and issued profile for one upstream account.
///
/// Invariant: `minecraft.token() == profile.token()`. The constructor checks
/// it and `set_minecraft_token` maintains it; the other setters each replace
/// exactly one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBundle {
    ms_username: String,
    msal: AccessToken,
    xbl: AccessToken,
    xsts: AccessToken,
    minecraft: AccessToken,
    profile: McProfile,
}

impl AuthBundle {
    pub fn new(
        ms_username: impl Into<String>,
        msal: AccessToken,
        xbl: AccessToken,
        xsts: AccessToken,
        minecraft: AccessToken,
        profile: McProfile,
    ) -> Result<Self> {
        let ms_username = ms_username.into();
        if !is_valid_ms_username(&ms_username) {
            return Err(Error::InvalidValue(format!(
                "not an email-shaped upstream username: {ms_username:?}"
            )));
        }
        if minecraft.token() != profile.token() {
            return Err(Error::InvalidValue(
                "profile token does not echo the game token".into(),
            ));
        }
        Ok(Self {
            ms_username,
            msal,
            xbl,
            xsts,
            minecraft,
            profile,
        })
    }

    pub fn ms_username(&self) -> &str {
        &self.ms_username
    }

    pub fn msal(&self) -> &AccessToken {
        &self.msal
    }

    pub fn xbl(&self) -> &AccessToken {
        &self.xbl
    }

    pub fn xsts(&self) -> &AccessToken {
        &self.xsts
    }

    pub fn minecraft(&self) -> &AccessToken {
        &self.minecraft
    }

    pub fn profile(&self) -> &McProfile {
        &self.profile
    }

    pub fn set_msal_token(&mut self, token: AccessToken) {
        self.msal = token;
    }

    pub fn set_xbl_token(&mut self, token: AccessToken) {
        self.xbl = token;
    }

    pub fn set_xsts_token(&mut self, token: AccessToken) {
        self.xsts = token;
    }

    /// Linked update: replaces the game token and rewrites the profile echo.
    pub fn set_minecraft_token(&mut self, token: AccessToken) {
        self.profile.token = token.token().to_string();
        self.minecraft = token;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};

    fn tok(s: &str) -> AccessToken {
        AccessToken::new(s, Utc::now() + TimeDelta::hours(1)).unwrap()
    }

    fn bundle() -> AuthBundle {
        AuthBundle::new(
            "player@example.com",
            tok("msal"),
            tok("xbl"),
            tok("xsts"),
            tok("mc"),
            McProfile::new("Steve", "069a79f444e94726a5befca90e38aaf5", "mc").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn rejects_non_email_username() {
        let err = AuthBundle::new(
            "player",
            tok("a"),
            tok("b"),
            tok("c"),
            tok("d"),
            McProfile::new("Steve", "u", "d").unwrap(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn rejects_mismatched_profile_echo() {
        let err = AuthBundle::new(
            "player@example.com",
            tok("a"),
            tok("b"),
            tok("c"),
            tok("d"),
            McProfile::new("Steve", "u", "stale").unwrap(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn game_token_setter_rewrites_echo() {
        let mut b = bundle();
        b.set_minecraft_token(tok("mc-renewed"));
        assert_eq!(b.minecraft().token(), "mc-renewed");
        assert_eq!(b.profile().token(), "mc-renewed");
        assert_eq!(b.profile().name(), "Steve");
    }

    #[test]
    fn stage_setters_touch_one_field() {
        let mut b = bundle();
        b.set_xbl_token(tok("xbl-renewed"));
        assert_eq!(b.xbl().token(), "xbl-renewed");
        assert_eq!(b.msal().token(), "msal");
        assert_eq!(b.xsts().token(), "xsts");
        assert_eq!(b.minecraft().token(), "mc");
        assert_eq!(b.profile().token(), "mc");
    }

    #[test]
    fn clone_is_deep() {
        let b = bundle();
        let mut c = b.clone();
        c.set_minecraft_token(tok("other"));
        assert_eq!(b.minecraft().token(), "mc");
        assert_eq!(b.profile().token(), "mc");
    }
}
