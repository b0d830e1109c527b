//! Scripted remote API for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::api::{ApiResponse, Connectivity, Method, Notifier, RemoteApi};
use crate::error::{Error, Result};

type ErrorFactory = Arc<dyn Fn() -> Error + Send + Sync>;
type RequestHook = Arc<dyn Fn(Method, &str) + Send + Sync>;

/// One scripted reply.
#[derive(Clone)]
pub enum Reply {
    Response(ApiResponse),
    Fail(ErrorFactory),
}

impl Reply {
    pub fn error(factory: impl Fn() -> Error + Send + Sync + 'static) -> Self {
        Self::Fail(Arc::new(factory))
    }
}

/// A request the double received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

/// In-memory `RemoteApi` and `Connectivity`.
///
/// Replies are scripted per method and path (query string ignored). The last
/// scripted reply of a route repeats. Unscripted writes succeed with the next
/// server version and unscripted downloads return no changes.
pub struct ScriptedApi {
    routes: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
    calls: Mutex<Vec<RecordedCall>>,
    uploads: Mutex<Vec<(String, String)>>,
    hook: Mutex<Option<RequestHook>>,
    online: AtomicBool,
    credentials: AtomicBool,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            hook: Mutex::new(None),
            online: AtomicBool::new(true),
            credentials: AtomicBool::new(true),
        }
    }

    /// Queue a reply for `method` on `path`.
    pub fn script(&self, method: Method, path: &str, reply: Reply) {
        self.routes
            .lock()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply);
    }

    pub fn respond(&self, method: Method, path: &str, response: ApiResponse) {
        self.script(method, path, Reply::Response(response));
    }

    pub fn fail(&self, method: Method, path: &str, factory: impl Fn() -> Error + Send + Sync + 'static) {
        self.script(method, path, Reply::error(factory));
    }

    /// Serve `records` from the `changes` endpoint of `base`.
    pub fn serve_changes(&self, base: &str, records: Value) {
        self.respond(Method::Get, &format!("{base}/changes"), ApiResponse::ok(records));
    }

    /// Run `hook` before each request is answered.
    pub fn on_request(&self, hook: impl Fn(Method, &str) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Arc::new(hook));
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_credentials(&self, present: bool) {
        self.credentials.store(present, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Calls with the given method whose path starts with `prefix`.
    pub fn calls_to(&self, method: Method, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.method == method && call.path.starts_with(prefix))
            .count()
    }

    /// `(path, file_name)` of received file uploads.
    pub fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().clone()
    }

    fn next_reply(&self, method: Method, route: &str) -> Option<Reply> {
        let mut routes = self.routes.lock();
        let queue = routes.get_mut(&(method, route.to_string()))?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    fn default_reply(method: Method, path: &str) -> ApiResponse {
        let base_version = query_param(path, "baseVersion")
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or_default();
        match method {
            Method::Get => ApiResponse::ok(json!([])),
            Method::Post | Method::Put => ApiResponse::ok(json!({ "version": base_version + 1 })),
            Method::Delete => ApiResponse::ok(Value::Null),
        }
    }
}

impl Default for ScriptedApi {
    fn default() -> Self {
        Self::new()
    }
}

fn query_param<'a>(path: &'a str, name: &str) -> Option<&'a str> {
    let (_, query) = path.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

#[async_trait]
impl RemoteApi for ScriptedApi {
    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        self.calls.lock().push(RecordedCall {
            method,
            path: path.to_string(),
            body: body.cloned(),
        });
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(method, path);
        }

        let route = path.split('?').next().unwrap_or(path);
        match self.next_reply(method, route) {
            Some(Reply::Response(response)) => Ok(response),
            Some(Reply::Fail(factory)) => Err(factory()),
            None => Ok(Self::default_reply(method, path)),
        }
    }

    fn has_credentials(&self) -> bool {
        self.credentials.load(Ordering::SeqCst)
    }

    async fn upload_file(
        &self,
        path: &str,
        file_name: &str,
        _mime_type: &str,
        _bytes: Vec<u8>,
    ) -> Result<ApiResponse> {
        self.uploads
            .lock()
            .push((path.to_string(), file_name.to_string()));
        match self.next_reply(Method::Post, path) {
            Some(Reply::Response(response)) => Ok(response),
            Some(Reply::Fail(factory)) => Err(factory()),
            None => Ok(ApiResponse::ok(Value::Null)),
        }
    }
}

#[async_trait]
impl Connectivity for ScriptedApi {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Notifier that keeps every `(title, message)` it receives.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    pub fn titles(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(title, _)| title.clone()).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, message: &str) {
        self.sent.lock().push((title.to_string(), message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn unscripted_writes_bump_base_version() {
        let api = ScriptedApi::new();
        let response = api
            .request(Method::Put, "/visits/v1?baseVersion=4", Some(&json!({})))
            .await
            .unwrap();
        assert_eq!(response.server_version, Some(5));
        assert_eq!(api.calls_to(Method::Put, "/visits/v1"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn last_reply_repeats() {
        let api = ScriptedApi::new();
        api.respond(Method::Post, "/visits", ApiResponse::failure(500, "first"));
        api.respond(Method::Post, "/visits", ApiResponse::failure(503, "rest"));

        for expected in [500, 503, 503] {
            let response = api.request(Method::Post, "/visits?clientId=a", None).await.unwrap();
            assert_eq!(response.status, Some(expected));
        }
    }
}
