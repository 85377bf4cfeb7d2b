//! Control-plane request signature and session cookie.
//!
//! Every call to the generation API carries three extra headers:
//!
//! | Header        | Value                                                      |
//! |---------------|------------------------------------------------------------|
//! | `Device-Time` | unix seconds                                               |
//! | `Sign`        | `md5("9e2c|<uri tail>|<platform>|<version>|<time>||11ac")` |
//! | `Sign-Ver`    | `1`                                                        |
//!
//! where `<uri tail>` is the last seven characters of the request path.

use md5::{Digest, Md5};

use crate::config::DeviceIdentity;

/// Seconds the session cookie advertises as its lifetime.
const SESSION_MAX_AGE: u64 = 5_184_000;

/// Last seven characters of `uri` (the whole string when shorter).
fn uri_tail(uri: &str) -> &str {
    let start = uri
        .char_indices()
        .rev()
        .nth(6)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &uri[start..]
}

/// Compute the `Sign` header for a control-plane call.
pub fn device_sign(uri: &str, platform_code: &str, version_code: &str, device_time: i64) -> String {
    let input = format!(
        "9e2c|{}|{platform_code}|{version_code}|{device_time}||11ac",
        uri_tail(uri)
    );
    hex::encode(Md5::digest(input.as_bytes()))
}

/// Cookie block for a session token.
pub fn session_cookie(token: &str, identity: &DeviceIdentity, now: i64) -> String {
    [
        format!("_tea_web_id={}", identity.web_id),
        "is_staff_user=false".to_string(),
        "store-region=cn-gd".to_string(),
        "store-region-src=uid".to_string(),
        format!("sid_guard={token}%7C{now}%7C{SESSION_MAX_AGE}%7CMon%2C+03-Feb-2025+08%3A17%3A09+GMT"),
        format!("uid_tt={}", identity.user_id),
        format!("uid_tt_ss={}", identity.user_id),
        format!("sid_tt={token}"),
        format!("sessionid={token}"),
        format!("sessionid_ss={token}"),
    ]
    .join("; ")
}
