//! Reorder backend HTTP client.
//!
//! Authenticated JSON requests against the team backend, with HTTP and
//! transport failures mapped onto `SyncError` so the sync engine can decide
//! between retrying, refreshing auth, or resolving a conflict.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::models::{ReorderRecord, VendorSnapshot};
use crate::remote::RemoteReorderStore;
use crate::storage::{self, RemoteCredentials};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity test.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Classify a transport-level `reqwest::Error`.
fn transport_error(url: &str, err: &reqwest::Error) -> SyncError {
    if err.is_connect() {
        return SyncError::TransientNetwork(format!("Cannot reach backend at {url}"));
    }
    if err.is_timeout() {
        return SyncError::TransientNetwork(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return SyncError::Validation(format!("Invalid backend URL: {url}"));
    }
    SyncError::TransientNetwork(format!("Network error communicating with {url}: {err}"))
}

/// Classify a non-success HTTP status. `detail` is the server's message.
pub fn status_error(status: StatusCode, detail: &str) -> SyncError {
    let code = status.as_u16();
    let message = if detail.trim().is_empty() {
        format!("HTTP {code}")
    } else {
        format!("{} (HTTP {code})", detail.trim())
    };
    match code {
        401 | 403 => SyncError::AuthExpired(message),
        404 | 410 => SyncError::NotFound(message),
        409 | 412 => SyncError::DataConflict(message),
        408 | 429 => SyncError::TransientNetwork(message),
        s if s >= 500 => SyncError::TransientNetwork(message),
        _ => SyncError::Remote(message),
    }
}

fn error_detail(body_text: &str) -> String {
    match serde_json::from_str::<Value>(body_text) {
        Ok(json) => json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body_text.trim().to_string()),
        Err(_) => body_text.trim().to_string(),
    }
}

// ---------------------------------------------------------------------------
// Connectivity test
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Lightweight health-check against the backend.
pub async fn test_connectivity(base_url: &str, api_key: &str) -> ConnectivityResult {
    let url = normalize_base_url(base_url);
    let health_url = format!("{url}/api/health");

    let client = match Client::builder().timeout(CONNECTIVITY_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => {
            return ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(format!("Failed to create HTTP client: {e}")),
            };
        }
    };

    let start = Instant::now();
    let resp = match client.get(&health_url).bearer_auth(api_key).send().await {
        Ok(r) => r,
        Err(e) => {
            return ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(transport_error(&url, &e).to_string()),
            };
        }
    };

    let latency = start.elapsed().as_millis() as u64;
    let status = resp.status();

    if status.is_success() {
        info!(latency_ms = latency, "connectivity test passed");
        ConnectivityResult {
            success: true,
            latency_ms: Some(latency),
            error: None,
        }
    } else {
        ConnectivityResult {
            success: false,
            latency_ms: Some(latency),
            error: Some(status_error(status, "").to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP remote
// ---------------------------------------------------------------------------

/// `RemoteReorderStore` over the team backend's REST API.
pub struct HttpReorderRemote {
    client: Client,
    credentials: RwLock<RemoteCredentials>,
}

impl HttpReorderRemote {
    pub fn new(credentials: RemoteCredentials) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Validation(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            credentials: RwLock::new(RemoteCredentials {
                backend_url: normalize_base_url(&credentials.backend_url),
                ..credentials
            }),
        })
    }

    /// Build from the credentials in the OS keyring, if configured.
    pub fn from_keyring() -> Option<Self> {
        let creds = storage::load_remote_credentials()?;
        match Self::new(creds) {
            Ok(remote) => Some(remote),
            Err(e) => {
                warn!("HTTP remote unavailable: {e}");
                None
            }
        }
    }

    pub fn user_id(&self) -> String {
        self.credentials
            .read()
            .map(|c| c.user_id.clone())
            .unwrap_or_default()
    }

    /// Perform an authenticated request. `path` includes the leading slash.
    async fn fetch(&self, method: Method, path: &str, body: Option<Value>) -> SyncResult<Value> {
        let (base, api_key, user_id) = {
            let creds = self.credentials.read()?;
            (
                creds.backend_url.clone(),
                creds.api_key.clone(),
                creds.user_id.clone(),
            )
        };
        let full_url = format!("{base}{path}");

        let mut req = self
            .client
            .request(method.clone(), &full_url)
            .bearer_auth(api_key)
            .header("x-reorder-user", user_id)
            .header("Content-Type", "application/json");
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req.send().await.map_err(|e| transport_error(&base, &e))?;
        let status = resp.status();
        debug!(method = %method, path, status = status.as_u16(), "backend request");

        let body_text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(status_error(status, &error_detail(&body_text)));
        }

        // Empty 204 responses come back as null.
        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| SyncError::Remote(format!("Invalid JSON from backend: {e}")))
    }
}

/// Accept either a bare array or `{ "items": [...] }` / `{ "data": [...] }`.
fn unwrap_list(resp: Value) -> Value {
    match resp {
        Value::Object(mut obj) => obj
            .remove("items")
            .or_else(|| obj.remove("data"))
            .unwrap_or(Value::Array(Vec::new())),
        Value::Null => Value::Array(Vec::new()),
        other => other,
    }
}

#[async_trait]
impl RemoteReorderStore for HttpReorderRemote {
    async fn list_records(&self) -> SyncResult<Vec<ReorderRecord>> {
        let resp = self.fetch(Method::GET, "/api/reorder/items", None).await?;
        Ok(serde_json::from_value(unwrap_list(resp))?)
    }

    async fn create_record(&self, record: &ReorderRecord) -> SyncResult<()> {
        let body = serde_json::to_value(record)?;
        self.fetch(Method::POST, "/api/reorder/items", Some(body))
            .await
            .map(|_| ())
    }

    async fn update_record(&self, record: &ReorderRecord) -> SyncResult<()> {
        let path = format!("/api/reorder/items/{}", percent_encode(&record.id));
        let body = serde_json::to_value(record)?;
        self.fetch(Method::PUT, &path, Some(body)).await.map(|_| ())
    }

    async fn delete_record(&self, id: &str) -> SyncResult<()> {
        let path = format!("/api/reorder/items/{}", percent_encode(id));
        match self.fetch(Method::DELETE, &path, None).await {
            Ok(_) | Err(SyncError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_vendor_data(&self) -> SyncResult<Vec<VendorSnapshot>> {
        let resp = self
            .fetch(Method::GET, "/api/reorder/vendor-data", None)
            .await?;
        Ok(serde_json::from_value(unwrap_list(resp))?)
    }

    async fn refresh_auth(&self) -> SyncResult<bool> {
        let Some(fresh) = storage::load_remote_credentials() else {
            return Ok(false);
        };
        let mut creds = self.credentials.write()?;
        if creds.api_key == fresh.api_key {
            return Ok(false);
        }
        info!("backend credentials refreshed from keyring");
        *creds = fresh;
        Ok(true)
    }

    async fn check_connectivity(&self) -> bool {
        let (base, api_key) = match self.credentials.read() {
            Ok(creds) => (creds.backend_url.clone(), creds.api_key.clone()),
            Err(_) => return false,
        };
        let result = test_connectivity(&base, &api_key).await;
        if let Some(error) = &result.error {
            debug!(error = %error, "connectivity probe failed");
        }
        result.success
    }
}
