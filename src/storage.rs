//! Backend credentials in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS/iOS the
//! Keychain, and on Linux the Secret Service API. The auth layer (out of
//! scope here) writes refreshed tokens into the same entries; the HTTP
//! remote re-reads them on `refresh_auth`.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};

use crate::api;

const SERVICE_NAME: &str = "reorder-sync";

const KEY_BACKEND_URL: &str = "backend_url";
const KEY_API_KEY: &str = "api_key";
const KEY_USER_ID: &str = "user_id";

const ALL_KEYS: &[&str] = &[KEY_BACKEND_URL, KEY_API_KEY, KEY_USER_ID];

/// Everything the HTTP remote needs to talk to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCredentials {
    pub backend_url: String,
    pub api_key: String,
    pub user_id: String,
}

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential. Returns `None` when the entry does not
/// exist (or the platform store is unavailable).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

pub fn is_configured() -> bool {
    load_remote_credentials().is_some()
}

pub fn load_remote_credentials() -> Option<RemoteCredentials> {
    let backend_url = get_credential(KEY_BACKEND_URL)?;
    let api_key = get_credential(KEY_API_KEY)?;
    Some(RemoteCredentials {
        backend_url: api::normalize_base_url(&backend_url),
        api_key,
        user_id: get_credential(KEY_USER_ID).unwrap_or_default(),
    })
}

/// Validate an onboarding payload without touching the store.
///
/// Accepts camelCase or snake_case keys:
/// `{ "backendUrl": "...", "apiKey": "...", "userId": "..." }`.
pub fn parse_credentials_payload(payload: &Value) -> Result<RemoteCredentials, String> {
    let field = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| payload.get(*k).and_then(Value::as_str))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let backend_url = field(&["backendUrl", "backend_url"])
        .map(|url| api::normalize_base_url(&url))
        .ok_or("Missing required field: backendUrl")?;
    let api_key = field(&["apiKey", "api_key"]).ok_or("Missing required field: apiKey")?;
    let user_id = field(&["userId", "user_id"]).unwrap_or_default();

    Ok(RemoteCredentials {
        backend_url,
        api_key,
        user_id,
    })
}

/// Persist credentials received during onboarding or a token refresh.
pub fn update_credentials(payload: &Value) -> Result<RemoteCredentials, String> {
    let creds = parse_credentials_payload(payload)?;
    set_credential(KEY_BACKEND_URL, &creds.backend_url)?;
    set_credential(KEY_API_KEY, &creds.api_key)?;
    if !creds.user_id.is_empty() {
        set_credential(KEY_USER_ID, &creds.user_id)?;
    }
    info!(user_id = %creds.user_id, "backend credentials updated");
    Ok(creds)
}

/// Delete every stored credential.
pub fn clear_credentials() -> Result<(), String> {
    info!("deleting all backend credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
