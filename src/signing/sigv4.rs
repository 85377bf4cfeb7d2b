//! Canonical request signing for the object-storage API.
//!
//! The storage endpoint speaks an AWS4-HMAC-SHA256 dialect. Only a minimal
//! header set is signed: `x-amz-date` always, `x-amz-security-token` when a
//! session token is present, and `x-amz-content-sha256` when a POST carries a
//! body.
//!
//! ```text
//! canonical request = METHOD \n path \n query \n headers \n signed-names \n sha256(POST body or "")
//! string to sign    = ALGORITHM \n timestamp \n scope \n sha256(canonical request)
//! signing key       = HMAC(HMAC(HMAC(HMAC("AWS4"+secret, date), region), service), "aws4_request")
//! ```

use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Signature algorithm name
pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Scope terminator
const TERMINATOR: &str = "aws4_request";

/// Region and service the signature is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningScope {
    /// Region, e.g. `cn-north-1`
    pub region: &'static str,
    /// Service, e.g. `imagex`
    pub service: &'static str,
}

impl SigningScope {
    /// Scope of the image storage service.
    pub const IMAGEX: SigningScope = SigningScope {
        region: "cn-north-1",
        service: "imagex",
    };
}

/// Credential triple taken from an upload ticket.
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    /// Access key id
    pub access_key_id: &'a str,
    /// Secret access key
    pub secret_access_key: &'a str,
    /// Session token, if the credentials are temporary
    pub session_token: Option<&'a str>,
}

/// A fully signed request. Built fresh for every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    /// Upper-case method
    pub method: String,
    /// Target URL
    pub url: Url,
    /// `YYYYMMDDTHHMMSSZ`
    pub timestamp: String,
    /// Sorted `k=v&k=v` query
    pub canonical_query: String,
    /// `name:value\n` lines, sorted by name
    pub canonical_headers: String,
    /// `;`-joined signed header names
    pub signed_headers: String,
    /// Hex SHA-256 of a POST body, otherwise of the empty string
    pub payload_hash: String,
    /// Hex signature
    pub signature: String,
    /// `Credential=` part of the authorization value
    pub credential: String,
    /// Session token copied from the credentials
    session_token: Option<String>,
    /// Whether the payload hash is one of the signed headers
    signs_payload: bool,
}

impl SignedRequest {
    /// Value for the `Authorization` header.
    pub fn authorization(&self) -> String {
        format!(
            "{ALGORITHM} Credential={}, SignedHeaders={}, Signature={}",
            self.credential, self.signed_headers, self.signature
        )
    }

    /// Headers that must accompany the request, authorization included.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("authorization", self.authorization()),
            ("x-amz-date", self.timestamp.clone()),
        ];
        if let Some(token) = &self.session_token {
            headers.push(("x-amz-security-token", token.clone()));
        }
        if self.signs_payload {
            headers.push(("x-amz-content-sha256", self.payload_hash.clone()));
        }
        headers
    }
}

/// Current UTC time in signing format.
pub fn timestamp_now() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Sort query pairs byte-wise by key and join them without re-encoding.
pub fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Derive the signing key for `date` (`YYYYMMDD`).
pub fn signing_key(secret: &str, date: &str, scope: SigningScope) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, scope.region.as_bytes());
    let k_service = hmac(&k_region, scope.service.as_bytes());
    hmac(&k_service, TERMINATOR.as_bytes())
}

/// Sign a request. Pure: the same inputs always give the same signature.
pub fn sign(
    method: &str,
    url: &Url,
    timestamp: &str,
    credentials: Credentials<'_>,
    body: Option<&[u8]>,
    scope: SigningScope,
) -> SignedRequest {
    let method = method.to_uppercase();
    let date = timestamp.get(..8).unwrap_or(timestamp);
    let path = match url.path() {
        "" => "/",
        path => path,
    };
    let query = canonical_query(url);

    let payload = body.filter(|b| !b.is_empty() && method == "POST");
    let payload_hash = sha256_hex(payload.unwrap_or_default());
    let signs_payload = payload.is_some();

    // Names are lower-case already
    let mut headers: Vec<(&str, &str)> = vec![("x-amz-date", timestamp)];
    if let Some(token) = credentials.session_token {
        headers.push(("x-amz-security-token", token));
    }
    if signs_payload {
        headers.push(("x-amz-content-sha256", payload_hash.as_str()));
    }
    headers.sort_by(|a, b| a.0.cmp(b.0));

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{}\n", value.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = [
        method.as_str(),
        path,
        query.as_str(),
        canonical_headers.as_str(),
        signed_headers.as_str(),
        payload_hash.as_str(),
    ]
    .join("\n");

    let credential_scope = format!("{date}/{}/{}/{TERMINATOR}", scope.region, scope.service);
    let string_to_sign = [
        ALGORITHM,
        timestamp,
        credential_scope.as_str(),
        sha256_hex(canonical_request.as_bytes()).as_str(),
    ]
    .join("\n");

    tracing::trace!(%canonical_request, %string_to_sign, "signing storage request");

    let key = signing_key(credentials.secret_access_key, date, scope);
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

    SignedRequest {
        method,
        url: url.clone(),
        timestamp: timestamp.to_string(),
        canonical_query: query,
        canonical_headers,
        signed_headers,
        payload_hash,
        signature,
        credential: format!("{}/{credential_scope}", credentials.access_key_id),
        session_token: credentials.session_token.map(str::to_string),
        signs_payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TS: &str = "20250101T120000Z";

    fn creds() -> Credentials<'static> {
        Credentials {
            access_key_id: "AKTEST",
            secret_access_key: "secret",
            session_token: Some("session-token"),
        }
    }

    fn apply_url() -> Url {
        Url::parse(
            "https://imagex.bytedanceapi.com/?Action=ApplyImageUpload&Version=2018-08-01&ServiceId=tb4s082cfz&FileSize=42&s=abc",
        )
        .unwrap()
    }

    #[test]
    fn test_empty_payload_hash() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_query_sorted_bytewise() {
        let url = Url::parse("https://x/?b=2&A=1&a=3").unwrap();
        // Upper-case sorts before lower-case
        assert_eq!(canonical_query(&url), "A=1&a=3&b=2");
        assert_eq!(
            canonical_query(&apply_url()),
            "Action=ApplyImageUpload&FileSize=42&ServiceId=tb4s082cfz&Version=2018-08-01&s=abc"
        );
    }

    #[test]
    fn test_get_signs_only_date_and_token() {
        let signed = sign("get", &apply_url(), TS, creds(), None, SigningScope::IMAGEX);
        assert_eq!(signed.method, "GET");
        assert_eq!(signed.signed_headers, "x-amz-date;x-amz-security-token");
        assert_eq!(
            signed.canonical_headers,
            "x-amz-date:20250101T120000Z\nx-amz-security-token:session-token\n"
        );
        assert!(signed
            .authorization()
            .starts_with("AWS4-HMAC-SHA256 Credential=AKTEST/20250101/cn-north-1/imagex/aws4_request, SignedHeaders=x-amz-date;x-amz-security-token, Signature="));
        assert_eq!(signed.signature.len(), 64);
        assert!(!signed.headers().iter().any(|(n, _)| *n == "x-amz-content-sha256"));
    }

    #[test]
    fn test_post_with_body_signs_content_hash() {
        let body = br#"{"SessionKey":"k","SuccessActionStatus":"200"}"#;
        let signed = sign("POST", &apply_url(), TS, creds(), Some(body), SigningScope::IMAGEX);
        assert_eq!(
            signed.signed_headers,
            "x-amz-content-sha256;x-amz-date;x-amz-security-token"
        );
        assert_eq!(signed.payload_hash, sha256_hex(body));
        assert!(signed
            .headers()
            .iter()
            .any(|(n, v)| *n == "x-amz-content-sha256" && *v == signed.payload_hash));
    }

    #[test]
    fn test_get_body_uses_empty_payload_hash() {
        let signed = sign("GET", &apply_url(), TS, creds(), Some(b"ignored"), SigningScope::IMAGEX);
        assert_eq!(signed.payload_hash, sha256_hex(b""));
        assert_eq!(signed.signed_headers, "x-amz-date;x-amz-security-token");
        assert_eq!(
            signed,
            sign("GET", &apply_url(), TS, creds(), None, SigningScope::IMAGEX)
        );
    }

    #[test]
    fn test_deterministic() {
        let a = sign("POST", &apply_url(), TS, creds(), Some(b"abc"), SigningScope::IMAGEX);
        let b = sign("POST", &apply_url(), TS, creds(), Some(b"abc"), SigningScope::IMAGEX);
        assert_eq!(a, b);
    }

    #[test]
    fn test_timestamp_changes_signature() {
        let a = sign("GET", &apply_url(), TS, creds(), None, SigningScope::IMAGEX);
        let b = sign("GET", &apply_url(), "20250101T120001Z", creds(), None, SigningScope::IMAGEX);
        assert_ne!(a.signature, b.signature);
    }

    #[test]
    fn test_signing_key_chain_length() {
        let key = signing_key("secret", "20250101", SigningScope::IMAGEX);
        assert_eq!(key.len(), 32);
        assert_ne!(key, signing_key("secret", "20250102", SigningScope::IMAGEX));
    }

    proptest! {
        #[test]
        fn prop_single_byte_flip_changes_signature(
            body in proptest::collection::vec(any::<u8>(), 1..256),
            idx in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let original = sign("POST", &apply_url(), TS, creds(), Some(&body), SigningScope::IMAGEX);

            let mut tampered = body.clone();
            let i = idx.index(tampered.len());
            tampered[i] ^= flip;
            let changed = sign("POST", &apply_url(), TS, creds(), Some(&tampered), SigningScope::IMAGEX);

            prop_assert_ne!(&original.payload_hash, &changed.payload_hash);
            prop_assert_ne!(&original.signature, &changed.signature);
        }

        #[test]
        fn prop_same_inputs_same_signature(body in proptest::collection::vec(any::<u8>(), 0..128)) {
            let a = sign("POST", &apply_url(), TS, creds(), Some(&body), SigningScope::IMAGEX);
            let b = sign("POST", &apply_url(), TS, creds(), Some(&body), SigningScope::IMAGEX);
            prop_assert_eq!(a.authorization(), b.authorization());
        }
    }
}
