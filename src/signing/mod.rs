//! Request signing.
//!
//! Two unrelated schemes live here:
//!
//! - [`sigv4`]: the canonical-request HMAC chain used by the object-storage
//!   API during reference uploads.
//! - [`device`]: the salted `Sign` header and cookie block the generation
//!   API expects on every call.
//!
//! Both are pure functions of their inputs; callers supply the timestamp.

pub mod device;
pub mod sigv4;

pub use device::{device_sign, session_cookie};
pub use sigv4::{sign, Credentials, SignedRequest, SigningScope};
