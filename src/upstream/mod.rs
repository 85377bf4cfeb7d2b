//! Upstream generation API.
//!
//! Every component that talks to the control plane goes through the
//! [`ControlPlane`] trait, so the poll engine, the upload pipeline and the
//! generator can be driven by a scripted fake in tests. The production
//! implementation is [`UpstreamSession`]: one [`UpstreamClient`] bound to one
//! session token.
//!
//! # Response envelope
//!
//! ```text
//! {"ret": "0",    "errmsg": "",    "data": {...}}   -> data
//! {"ret": "5000", "errmsg": "..."}                  -> InsufficientCredit
//! {"ret": "1015", "errmsg": "..."}                  -> UpstreamCallFailed
//! {...no numeric ret...}                            -> whole body
//! ```

pub mod account;
pub mod client;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::{JimengError, Result};

pub use account::{ensure_credit, get_credit, receive_credit, token_live, Credit};
pub use client::{UpstreamClient, UpstreamSession};

/// Submit a draft
pub const GENERATE_URI: &str = "/mweb/v1/aigc_draft/generate";
/// Primary status endpoint
pub const HISTORY_BY_IDS_URI: &str = "/mweb/v1/get_history_by_ids";
/// Secondary status endpoint
pub const HISTORY_RECORDS_URI: &str = "/mweb/v1/get_history_records";
/// Upload credentials
pub const UPLOAD_TOKEN_URI: &str = "/mweb/v1/get_upload_token";
/// Credit balance
pub const USER_CREDIT_URI: &str = "/commerce/v1/benefits/user_credit";
/// Daily credit claim
pub const CREDIT_RECEIVE_URI: &str = "/commerce/v1/benefits/credit_receive";
/// Account info, used as a token liveness probe
pub const ACCOUNT_INFO_URI: &str = "/passport/account/info/v2";

/// A single control-plane call. Always a POST with a JSON body.
#[derive(Debug, Clone)]
pub struct ApiCall {
    /// Path below the base URL
    pub uri: String,
    /// Extra query parameters, appended after the common ones
    pub params: Vec<(String, String)>,
    /// JSON body
    pub body: Value,
    /// Add `http_common_info.aid` to the body
    pub common_info: bool,
    /// Override the default `Referer`
    pub referer: Option<String>,
}

impl ApiCall {
    /// POST `body` to `uri`.
    pub fn post(uri: impl Into<String>, body: Value) -> Self {
        Self {
            uri: uri.into(),
            params: Vec::new(),
            body,
            common_info: false,
            referer: None,
        }
    }

    /// Append query parameters.
    pub fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        self.params.extend(params);
        self
    }

    /// Ask the client to stamp `http_common_info` into the body.
    pub fn with_common_info(mut self) -> Self {
        self.common_info = true;
        self
    }

    /// Override the `Referer` header.
    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }
}

/// Authenticated access to the generation API.
///
/// Implementations return the unwrapped `data` of the response envelope.
pub trait ControlPlane: Send + Sync {
    /// Perform one call, including any per-call transport retries.
    fn call(&self, call: ApiCall) -> BoxFuture<'_, Result<Value>>;
}

/// Normalise `ret` to a string, accepting numbers too.
fn ret_code(body: &Value) -> Option<String> {
    match body.get("ret")? {
        Value::String(s) if s.trim().parse::<f64>().is_ok_and(f64::is_finite) => {
            Some(s.trim().to_string())
        },
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Unwrap the response envelope.
pub fn check_envelope(body: Value) -> Result<Value> {
    let Some(ret) = ret_code(&body) else {
        return Ok(body);
    };
    let errmsg = body
        .get("errmsg")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match ret.as_str() {
        "0" => Ok(body.get("data").cloned().unwrap_or(Value::Null)),
        "5000" => Err(JimengError::InsufficientCredit(errmsg)),
        code => Err(JimengError::UpstreamCallFailed(format!("ret {code}: {errmsg}"))),
    }
}
