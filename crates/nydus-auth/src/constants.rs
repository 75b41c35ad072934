//! Endpoint URLs and request constants for the four-stage chain
//!
//! The chain is Microsoft identity (consumers tenant) → Xbox Live → XSTS →
//! Minecraft services. Request envelopes are fixed; responses are parsed for
//! the fields named in `pipeline`.

/// Consumers-tenant token endpoint. Serves both the refresh-token grant
/// (silent renewal) and the device-code grant (interactive sign-in).
pub const MSAL_TOKEN_ENDPOINT: &str =
    "https://login.microsoftonline.com/consumers/oauth2/v2.0/token";

/// Consumers-tenant device-authorization endpoint (RFC 8628).
pub const MSAL_DEVICE_CODE_ENDPOINT: &str =
    "https://login.microsoftonline.com/consumers/oauth2/v2.0/devicecode";

/// Scopes requested from the identity provider. `offline_access` yields the
/// refresh token that makes later silent renewals possible.
pub const MSAL_SCOPES: &str = "XboxLive.signin offline_access";

/// Xbox Live user authentication endpoint.
pub const XBL_AUTH_ENDPOINT: &str = "https://user.auth.xboxlive.com/user/authenticate";

/// Xbox Secure Token Service authorization endpoint.
pub const XSTS_AUTH_ENDPOINT: &str = "https://xsts.auth.xboxlive.com/xsts/authorize";

/// Minecraft services login endpoint, entered with an XSTS token.
pub const MC_AUTH_ENDPOINT: &str =
    "https://api.minecraftservices.com/authentication/login_with_xbox";

/// Minecraft profile endpoint, read with a bearer game token.
pub const MC_PROFILE_ENDPOINT: &str = "https://api.minecraftservices.com/minecraft/profile";
