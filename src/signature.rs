//! HMAC-SHA256 verification for install callbacks and webhooks.
//!
//! Install callbacks sign their query string: parameters sorted by key,
//! `hmac`/`signature` removed, joined as `key=value&key=value`, hex-encoded.
//! Webhooks sign the raw request body and send the digest base64-encoded.
//!
//! Both checks return `false` for any malformed input instead of erroring.
//! Digests are compared with `Mac::verify_slice`, which is constant time.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Query parameters excluded from the signed string
pub const UNSIGNED_PARAMS: [&str; 2] = ["hmac", "signature"];

/// Stateless verifier bound to the platform's shared secret
#[derive(Clone)]
pub struct HmacVerifier {
    secret: String,
}

impl std::fmt::Debug for HmacVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacVerifier").finish_non_exhaustive()
    }
}

impl HmacVerifier {
    /// Create a verifier for the given shared secret
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Verify an OAuth install callback's query parameters
    pub fn verify_install_callback<I, K, V>(&self, params: I) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        verify_install_callback(params, &self.secret)
    }

    /// Verify a webhook body against its signature header
    pub fn verify_webhook(&self, raw_body: &[u8], signature_header: &str) -> bool {
        verify_webhook(raw_body, signature_header, &self.secret)
    }
}

/// Build the canonical signed string for a parameter set.
///
/// Returns the canonical string and the `hmac` value, if one was present.
pub fn canonicalize<I, K, V>(params: I) -> (String, Option<String>)
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut provided = None;
    let mut pairs: Vec<(String, String)> = Vec::new();

    for (key, value) in params {
        let (key, value) = (key.as_ref(), value.as_ref());
        if key == "hmac" {
            provided = Some(value.to_string());
        }
        if UNSIGNED_PARAMS.contains(&key) {
            continue;
        }
        pairs.push((key.to_string(), value.to_string()));
    }

    pairs.sort();

    let canonical = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    (canonical, provided)
}

/// Verify an install callback parameter set with the given secret
pub fn verify_install_callback<I, K, V>(params: I, secret: &str) -> bool
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let (canonical, provided) = canonicalize(params);
    let Some(provided) = provided else {
        return false;
    };
    let Ok(provided) = hex::decode(provided.trim()) else {
        return false;
    };
    digest_matches(secret, canonical.as_bytes(), &provided)
}

/// Verify a webhook's raw body with the given secret.
///
/// The body must be the exact bytes received; re-serialized JSON will not
/// verify.
pub fn verify_webhook(raw_body: &[u8], signature_header: &str, secret: &str) -> bool {
    let signature_header = signature_header.trim();
    if signature_header.is_empty() {
        return false;
    }
    let Ok(provided) = BASE64_STANDARD.decode(signature_header) else {
        return false;
    };
    digest_matches(secret, raw_body, &provided)
}

/// Hex HMAC for a parameter set, as the platform would send it
pub fn sign_params<I, K, V>(params: I, secret: &str) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let (canonical, _) = canonicalize(params);
    hmac_sha256(secret, canonical.as_bytes())
        .map(hex::encode)
        .unwrap_or_default()
}

/// Base64 HMAC for a webhook body, as the platform would send it
pub fn sign_webhook(raw_body: &[u8], secret: &str) -> String {
    hmac_sha256(secret, raw_body)
        .map(|digest| BASE64_STANDARD.encode(digest))
        .unwrap_or_default()
}

/// MAC keyed with `secret` over `message`. An empty secret never verifies.
fn keyed_mac(secret: &str, message: &[u8]) -> Option<HmacSha256> {
    if secret.is_empty() {
        return None;
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(message);
    Some(mac)
}

fn hmac_sha256(secret: &str, message: &[u8]) -> Option<Vec<u8>> {
    keyed_mac(secret, message).map(|mac| mac.finalize().into_bytes().to_vec())
}

/// Constant-time check of a provided digest. A digest of the wrong length
/// is rejected.
fn digest_matches(secret: &str, message: &[u8], provided: &[u8]) -> bool {
    keyed_mac(secret, message).is_some_and(|mac| mac.verify_slice(provided).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SECRET: &str = "hush";

    fn signed_callback() -> Vec<(String, String)> {
        let mut params = vec![
            ("shop".to_string(), "acme.myshopify.com".to_string()),
            ("code".to_string(), "0907a61c0c8d55e99db179b68161bc00".to_string()),
            ("state".to_string(), "0.6784241404160823".to_string()),
            ("timestamp".to_string(), "1337178173".to_string()),
        ];
        let hmac = sign_params(params.clone(), SECRET);
        params.push(("hmac".to_string(), hmac));
        params
    }

    #[test]
    fn test_canonical_string_sorted_and_filtered() {
        let (canonical, hmac) = canonicalize([
            ("timestamp", "1"),
            ("hmac", "abc"),
            ("code", "x"),
            ("signature", "legacy"),
            ("shop", "a.myshopify.com"),
        ]);
        assert_eq!(canonical, "code=x&shop=a.myshopify.com&timestamp=1");
        assert_eq!(hmac.as_deref(), Some("abc"));
    }

    #[test]
    fn test_install_callback_valid() {
        assert!(verify_install_callback(signed_callback(), SECRET));
    }

    #[test]
    fn test_install_callback_order_independent() {
        let mut params = signed_callback();
        params.reverse();
        assert!(verify_install_callback(params, SECRET));
    }

    #[test]
    fn test_install_callback_wrong_secret() {
        assert!(!verify_install_callback(signed_callback(), "other"));
    }

    #[test]
    fn test_install_callback_malformed() {
        assert!(!verify_install_callback([("shop", "a.myshopify.com")], SECRET));
        assert!(!verify_install_callback(
            [("shop", "a.myshopify.com"), ("hmac", "zz-not-hex")],
            SECRET
        ));
        assert!(!verify_install_callback(
            [("shop", "a.myshopify.com"), ("hmac", "abcd")],
            SECRET
        ));
        assert!(!verify_install_callback(signed_callback(), ""));
    }

    #[test]
    fn test_webhook_valid_and_tampered() {
        let body = br#"{"id":1,"domain":"acme.myshopify.com"}"#;
        let sig = sign_webhook(body, SECRET);
        assert!(verify_webhook(body, &sig, SECRET));

        let reordered = br#"{"domain":"acme.myshopify.com","id":1}"#;
        assert!(!verify_webhook(reordered, &sig, SECRET));
        assert!(!verify_webhook(body, "", SECRET));
        assert!(!verify_webhook(body, "%%%", SECRET));
        assert!(!verify_webhook(body, "c2hvcnQ=", SECRET));
    }

    #[test]
    fn test_digest_matches() {
        let message = b"payload";
        let digest = hmac_sha256(SECRET, message).unwrap();

        assert!(digest_matches(SECRET, message, &digest));

        let mut flipped = digest.clone();
        flipped[31] ^= 1;
        assert!(!digest_matches(SECRET, message, &flipped));

        // Length mismatch, truncated or extended
        assert!(!digest_matches(SECRET, message, &digest[..31]));
        let mut extended = digest.clone();
        extended.push(0);
        assert!(!digest_matches(SECRET, message, &extended));
        assert!(!digest_matches(SECRET, message, &[]));

        assert!(!digest_matches("", message, &digest));
    }

    proptest! {
        #[test]
        fn prop_signed_params_verify(
            shop in "[a-z0-9]{1,20}",
            code in "[a-f0-9]{8,32}",
            ts in 0u64..2_000_000_000,
        ) {
            let mut params = vec![
                ("shop".to_string(), format!("{shop}.myshopify.com")),
                ("code".to_string(), code),
                ("timestamp".to_string(), ts.to_string()),
            ];
            let hmac = sign_params(params.clone(), SECRET);
            params.push(("hmac".to_string(), hmac));
            prop_assert!(verify_install_callback(params, SECRET));
        }

        #[test]
        fn prop_single_char_mutation_fails(
            code in "[a-f0-9]{8,32}",
            idx in 0usize..64,
            field in 0usize..2,
        ) {
            let mut params = vec![
                ("shop".to_string(), "acme.myshopify.com".to_string()),
                ("code".to_string(), code),
            ];
            let mut hmac = sign_params(params.clone(), SECRET).into_bytes();

            if field == 0 {
                let i = idx % hmac.len();
                hmac[i] = if hmac[i] == b'0' { b'1' } else { b'0' };
            } else {
                let value = mutate_one_char(&params[1].1, idx);
                params[1].1 = value;
            }

            params.push(("hmac".to_string(), String::from_utf8(hmac).unwrap()));
            prop_assert!(!verify_install_callback(params, SECRET));
        }

        #[test]
        fn prop_webhook_body_mutation_fails(body in "[ -~]{1,200}", idx in 0usize..200) {
            let sig = sign_webhook(body.as_bytes(), SECRET);
            prop_assert!(verify_webhook(body.as_bytes(), &sig, SECRET));
            let mutated = mutate_one_char(&body, idx);
            prop_assert!(!verify_webhook(mutated.as_bytes(), &sig, SECRET));
        }
    }

    /// Replace one ASCII character with a different one.
    fn mutate_one_char(s: &str, idx: usize) -> String {
        let mut bytes = s.as_bytes().to_vec();
        let i = idx % bytes.len();
        bytes[i] = if bytes[i] == b'a' { b'b' } else { b'a' };
        String::from_utf8(bytes).unwrap()
    }
}
