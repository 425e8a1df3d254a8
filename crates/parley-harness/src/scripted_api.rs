//! Scripted REST double.
//!
//! Responses are queued per request path. A path with nothing queued answers
//! with its sticky response if one is set, otherwise with an empty success
//! (`0` for unread counts, `null` data for everything else).

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use parley_client::{ApiError, ApiRequest, ApiResponse, RestApi};
use parley_core::Credentials;
use serde_json::Value;

type Reply = Result<ApiResponse, ApiError>;

#[derive(Debug, Default)]
struct Script {
    queued: HashMap<String, VecDeque<Reply>>,
    sticky: HashMap<String, Reply>,
    calls: Vec<(String, ApiRequest)>,
}

/// [`RestApi`] that replays scripted answers and records every call.
#[derive(Debug, Clone, Default)]
pub struct ScriptedApi {
    script: Arc<Mutex<Script>>,
}

impl ScriptedApi {
    /// Double with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next call to `path` with `reply`.
    pub fn respond(&self, path: &str, reply: Reply) {
        self.lock().queued.entry(path.to_string()).or_default().push_back(reply);
    }

    /// Answer the next call to `path` with `data` as the envelope payload.
    pub fn respond_data(&self, path: &str, data: Value) {
        self.respond(path, Ok(ApiResponse::from_data(data)));
    }

    /// Answer the next `times` calls to `path` with `error`.
    pub fn fail(&self, path: &str, times: usize, error: &ApiError) {
        for _ in 0..times {
            self.respond(path, Err(error.clone()));
        }
    }

    /// Answer every unscripted call to `path` with `reply`.
    pub fn respond_always(&self, path: &str, reply: Reply) {
        self.lock().sticky.insert(path.to_string(), reply);
    }

    /// Every request so far with the user it was made for.
    pub fn calls(&self) -> Vec<(String, ApiRequest)> {
        self.lock().calls.clone()
    }

    /// Requests so far, without users.
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.lock().calls.iter().map(|(_, request)| request.clone()).collect()
    }

    /// How many calls hit `path`.
    pub fn calls_to(&self, path: &str) -> usize {
        self.lock().calls.iter().filter(|(_, request)| request.path() == path).count()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn answer(&self, credentials: &Credentials, request: &ApiRequest) -> Reply {
        let path = request.path();
        let mut script = self.lock();
        script.calls.push((credentials.user_id().to_string(), request.clone()));

        if let Some(reply) = script.queued.get_mut(&path).and_then(VecDeque::pop_front) {
            return reply;
        }
        if let Some(reply) = script.sticky.get(&path) {
            return reply.clone();
        }
        Ok(match request {
            ApiRequest::NotificationUnreadCount | ApiRequest::ChatUnreadCount => {
                ApiResponse::from_data(Value::from(0))
            },
            _ => ApiResponse::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RestApi for ScriptedApi {
    fn execute(
        &self,
        credentials: &Credentials,
        request: &ApiRequest,
    ) -> impl Future<Output = Result<ApiResponse, ApiError>> + Send {
        let reply = self.answer(credentials, request);
        tracing::debug!(path = %request.path(), ok = reply.is_ok(), "scripted api call");
        std::future::ready(reply)
    }
}
