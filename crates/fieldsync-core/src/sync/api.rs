//! Collaborators the sync engine calls out to.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{RecordId, RemoteRecord};

/// HTTP verb of a remote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one remote request that reached the server.
///
/// Transport failures (no route, reset, timeout) are reported as `Err`
/// by [`RemoteApi::request`] instead.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiResponse {
    /// 2xx response
    pub success: bool,
    /// HTTP status code
    pub status: Option<u16>,
    /// Response body
    pub data: Option<Value>,
    /// Server-provided error message
    pub error: Option<String>,
    /// The server rejected the write as a version conflict
    pub conflict: bool,
    /// Server's current representation, attached to conflicts
    pub server_data: Option<Value>,
    /// Server version after the request
    pub server_version: Option<i64>,
}

impl ApiResponse {
    /// A successful response carrying `data`.
    pub fn ok(data: Value) -> Self {
        let server_version = data.get("version").and_then(Value::as_i64);
        Self {
            success: true,
            status: Some(200),
            data: Some(data),
            server_version,
            ..Self::default()
        }
    }

    /// A 409 response carrying the server's current record.
    pub fn conflict(server_data: Value) -> Self {
        let server_version = server_data.get("version").and_then(Value::as_i64);
        Self {
            status: Some(409),
            conflict: true,
            server_data: Some(server_data),
            server_version,
            error: Some("Version conflict".to_string()),
            ..Self::default()
        }
    }

    /// A failed response with the given status.
    pub fn failure(status: u16, error: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// The server's current record for `id`, if the response carried one.
    ///
    /// Accepts either a full `RemoteRecord` or a bare payload; a bare payload
    /// takes its version from `server_version`.
    pub fn remote_record(&self, id: &RecordId) -> Option<RemoteRecord> {
        let data = self.server_data.as_ref()?;
        if let Ok(mut remote) = serde_json::from_value::<RemoteRecord>(data.clone()) {
            remote.id = id.clone();
            return Some(remote);
        }
        Some(RemoteRecord {
            id: id.clone(),
            version: self.server_version.unwrap_or_default(),
            payload: data.clone(),
            deleted: false,
            updated_at: None,
        })
    }

    /// Classify a non-success, non-conflict response.
    pub fn failure_error(&self) -> Error {
        let message = self
            .error
            .clone()
            .unwrap_or_else(|| format!("HTTP {}", self.status.unwrap_or_default()));
        match self.status {
            Some(401 | 403) => Error::Auth(message),
            Some(408 | 429) => Error::network_retryable(message, self.status),
            Some(status) if status >= 500 => Error::network_retryable(message, self.status),
            status => Error::network_fatal(message, status),
        }
    }
}

/// Connectivity oracle.
#[async_trait]
pub trait Connectivity: Send + Sync {
    /// Whether the remote API is reachable right now.
    async fn is_online(&self) -> bool;
}

/// Authenticated request function into the business API.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Send a request. `path` is relative to the API base and may carry a query.
    async fn request(&self, method: Method, path: &str, body: Option<&Value>)
        -> Result<ApiResponse>;

    /// Whether credentials are configured.
    fn has_credentials(&self) -> bool;

    /// Upload attachment bytes to `path`.
    async fn upload_file(
        &self,
        path: &str,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<ApiResponse>;
}

/// Mapping from record type to API base path.
pub trait EndpointMap: Send + Sync {
    /// Base path for `item_type`, e.g. `/field-sales/visits`.
    fn base_path(&self, item_type: &str) -> Option<String>;

    /// Incremental download path for `item_type`.
    fn changes_path(&self, item_type: &str, since: i64) -> Option<String> {
        self.base_path(item_type)
            .map(|base| format!("{}/changes?since={since}", base.trim_end_matches('/')))
    }
}

impl EndpointMap for BTreeMap<String, String> {
    fn base_path(&self, item_type: &str) -> Option<String> {
        self.get(item_type).cloned()
    }
}

impl<T: EndpointMap + ?Sized> EndpointMap for Arc<T> {
    fn base_path(&self, item_type: &str) -> Option<String> {
        (**self).base_path(item_type)
    }
}

/// Local notification sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

/// Notifier that writes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, message: &str) {
        tracing::info!(target: "fieldsync::notify", "{title}: {message}");
    }
}

/// Connectivity flag toggled by the host application.
#[derive(Debug, Clone)]
pub struct StaticConnectivity {
    online: Arc<AtomicBool>,
}

impl StaticConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Default for StaticConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl Connectivity for StaticConnectivity {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failure_classification() {
        assert!(matches!(
            ApiResponse::failure(401, "expired").failure_error(),
            Error::Auth(_)
        ));
        assert!(matches!(
            ApiResponse::failure(403, "denied").failure_error(),
            Error::Auth(_)
        ));
        assert!(ApiResponse::failure(503, "busy").failure_error().is_retryable());
        assert!(ApiResponse::failure(429, "slow down").failure_error().is_retryable());
        assert!(!ApiResponse::failure(422, "bad field").failure_error().is_retryable());
    }

    #[test]
    fn remote_record_from_full_or_bare_server_data() {
        let id = RecordId::from("visit_1");

        let full = ApiResponse::conflict(json!({"id": "visit_1", "version": 3, "payload": {"a": 1}}));
        let remote = full.remote_record(&id).unwrap();
        assert_eq!(remote.version, 3);
        assert_eq!(remote.payload, json!({"a": 1}));

        let mut bare = ApiResponse::conflict(json!({"notes": "server"}));
        bare.server_version = Some(5);
        let remote = bare.remote_record(&id).unwrap();
        assert_eq!(remote.version, 5);
        assert_eq!(remote.payload, json!({"notes": "server"}));

        assert!(ApiResponse::ok(json!({})).remote_record(&id).is_none());
    }

    #[test]
    fn changes_path_uses_base() {
        let mut endpoints = BTreeMap::new();
        endpoints.insert("visit".to_string(), "/field-sales/visits/".to_string());

        assert_eq!(
            endpoints.changes_path("visit", 42).as_deref(),
            Some("/field-sales/visits/changes?since=42")
        );
        assert!(endpoints.changes_path("sale", 42).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn static_connectivity_toggles() {
        let connectivity = StaticConnectivity::new(false);
        assert!(!connectivity.is_online().await);
        connectivity.set_online(true);
        assert!(connectivity.is_online().await);
    }
}
