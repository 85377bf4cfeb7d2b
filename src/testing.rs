//! Scripted fakes for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::{JimengError, Result};
use crate::job::{AssetRole, AssetSource};
use crate::upload::AssetUploader;
use crate::upstream::{ApiCall, ControlPlane};

enum Reply {
    Data(Value),
    Fail(JimengError),
}

impl Reply {
    fn produce(&self) -> Result<Value> {
        match self {
            Reply::Data(value) => Ok(value.clone()),
            Reply::Fail(err) => Err(duplicate(err)),
        }
    }
}

/// Rebuild an error so a scripted failure can be returned more than once.
fn duplicate(err: &JimengError) -> JimengError {
    match err {
        JimengError::Validation(m) => JimengError::Validation(m.clone()),
        JimengError::UpstreamCallFailed(m) => JimengError::UpstreamCallFailed(m.clone()),
        JimengError::InsufficientCredit(m) => JimengError::InsufficientCredit(m.clone()),
        JimengError::ContentFiltered { correlation_id } => JimengError::ContentFiltered {
            correlation_id: correlation_id.clone(),
        },
        JimengError::GenerationFailed {
            correlation_id,
            fail_code,
        } => JimengError::GenerationFailed {
            correlation_id: correlation_id.clone(),
            fail_code: fail_code.clone(),
        },
        JimengError::NoRecordId => JimengError::NoRecordId,
        JimengError::RecordMissing { correlation_id } => JimengError::RecordMissing {
            correlation_id: correlation_id.clone(),
        },
        JimengError::AssetExtractionFailed { correlation_id } => {
            JimengError::AssetExtractionFailed {
                correlation_id: correlation_id.clone(),
            }
        },
        JimengError::UploadFailed(m) => JimengError::UploadFailed(m.clone()),
        JimengError::TimedOut { correlation_id } => JimengError::TimedOut {
            correlation_id: correlation_id.clone(),
        },
        other => JimengError::Config(other.to_string()),
    }
}

/// Control plane answering from per-URI queues.
///
/// Replies are consumed in order; the last reply for a URI repeats forever.
/// Calls to an unscripted URI fail with a transport error.
#[derive(Default)]
pub struct ScriptedControlPlane {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<ApiCall>>,
}

impl ScriptedControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, uri: &str, reply: Reply) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(uri.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Queue a successful reply.
    pub fn respond(self, uri: &str, data: Value) -> Self {
        self.push(uri, Reply::Data(data))
    }

    /// Queue a failure.
    pub fn fail(self, uri: &str, err: JimengError) -> Self {
        self.push(uri, Reply::Fail(err))
    }

    fn recorded(&self, uri: &str) -> Vec<ApiCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.uri == uri)
            .cloned()
            .collect()
    }

    pub fn calls_to(&self, uri: &str) -> usize {
        self.recorded(uri).len()
    }

    pub fn bodies_to(&self, uri: &str) -> Vec<Value> {
        self.recorded(uri).into_iter().map(|c| c.body).collect()
    }

    pub fn params_to(&self, uri: &str) -> Vec<Vec<(String, String)>> {
        self.recorded(uri).into_iter().map(|c| c.params).collect()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl ControlPlane for ScriptedControlPlane {
    fn call(&self, call: ApiCall) -> BoxFuture<'_, Result<Value>> {
        let reply = {
            let mut replies = self.replies.lock().unwrap();
            match replies.get_mut(&call.uri) {
                Some(queue) if queue.len() > 1 => queue.pop_front().map(|r| r.produce()),
                Some(queue) => queue.front().map(Reply::produce),
                None => None,
            }
        };
        let reply = reply.unwrap_or_else(|| {
            Err(JimengError::UpstreamCallFailed(format!("no script for {}", call.uri)))
        });
        self.calls.lock().unwrap().push(call);
        Box::pin(async move { reply })
    }
}

/// Uploader that succeeds unless the source is marked as failing.
#[derive(Default)]
pub struct ScriptedUploader {
    failing: HashSet<String>,
    attempts: AtomicUsize,
}

impl ScriptedUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, source: &str) -> Self {
        self.failing.insert(source.to_string());
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl AssetUploader for ScriptedUploader {
    fn upload<'a>(&'a self, source: &'a AssetSource, _role: AssetRole) -> BoxFuture<'a, Result<String>> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        let key = match source {
            AssetSource::Remote(url) | AssetSource::Inline(url) => url.clone(),
        };
        let result = if self.failing.contains(&key) {
            Err(JimengError::UploadFailed(format!("scripted failure for {key}")))
        } else {
            Ok(format!("tos-cn-i-test/{n}"))
        };
        Box::pin(async move { result })
    }
}
