//! Default `RemoteApi` over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use super::api::{ApiResponse, Connectivity, Method, RemoteApi};
use crate::error::{Error, Result};
use crate::util::{compact_text, is_http_url, normalize_text_option};

const PROBE_TIMEOUT_SECS: u64 = 4;

/// Bearer-token client for the business REST API.
#[derive(Clone)]
pub struct HttpRemoteApi {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemoteApi {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteApi")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpRemoteApi {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::InvalidInput(format!("HTTP client setup failed: {error}")))?;
        Ok(Self {
            base_url,
            token: normalize_text_option(token),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.header("Accept", "application/json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<ApiResponse> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        Ok(api_response(status, &body))
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse> {
        let url = self.url(path);
        let builder = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        };
        let builder = match body {
            Some(body) => builder.json(body),
            None => builder,
        };
        tracing::debug!("{method} {url}");
        self.send(builder).await
    }

    fn has_credentials(&self) -> bool {
        self.token.is_some()
    }

    async fn upload_file(
        &self,
        path: &str,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<ApiResponse> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .map_err(|error| Error::InvalidInput(format!("Invalid MIME type '{mime_type}': {error}")))?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let url = self.url(path);
        tracing::debug!("POST {url} (multipart {file_name})");
        self.send(self.client.post(&url).multipart(form)).await
    }
}

#[async_trait]
impl Connectivity for HttpRemoteApi {
    /// Any HTTP answer from the base URL counts as online.
    async fn is_online(&self) -> bool {
        let probe = self
            .client
            .head(&self.base_url)
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .send()
            .await;
        match probe {
            Ok(_) => true,
            Err(error) => {
                tracing::debug!("Connectivity probe failed: {error}");
                false
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
    #[serde(alias = "server_data", alias = "current")]
    server_data: Option<Value>,
    #[serde(alias = "server_version")]
    server_version: Option<i64>,
}

fn api_response(status: StatusCode, body: &str) -> ApiResponse {
    let json = if body.trim().is_empty() {
        None
    } else {
        serde_json::from_str::<Value>(body).ok()
    };

    if status.is_success() {
        return ApiResponse {
            status: Some(status.as_u16()),
            ..ApiResponse::ok(json.unwrap_or(Value::Null))
        };
    }

    let parsed = json
        .as_ref()
        .and_then(|value| serde_json::from_value::<ErrorBody>(value.clone()).ok())
        .unwrap_or_default();

    if status == StatusCode::CONFLICT {
        let server_data = parsed.server_data.or(json);
        let mut response = ApiResponse::conflict(server_data.unwrap_or(Value::Null));
        if parsed.server_version.is_some() {
            response.server_version = parsed.server_version;
        }
        if response.server_data.as_ref().is_some_and(Value::is_null) {
            response.server_data = None;
        }
        return response;
    }

    ApiResponse::failure(status.as_u16(), error_message(status, parsed, body))
}

fn error_message(status: StatusCode, parsed: ErrorBody, body: &str) -> String {
    if let Some(message) = parsed.message.or(parsed.error) {
        return format!("{} ({})", compact_text(&message), status.as_u16());
    }
    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{trimmed} ({})", status.as_u16())
    }
}

fn transport_error(error: reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::Timeout
    } else {
        Error::network_retryable(error.to_string(), error.status().map(|s| s.as_u16()))
    }
}

fn normalize_base_url(raw: String) -> Result<String> {
    let url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::InvalidInput("API base URL must not be empty".to_string()))?;
    if is_http_url(&url) {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "API base URL must include http:// or https://".to_string(),
        ))
    }
}
