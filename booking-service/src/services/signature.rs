//! Gateway signature verification.
//!
//! Gateways sign a canonical form of their payload that is not fully
//! documented, so the verifier recomputes the HMAC over an ordered list of
//! candidate serializations and accepts when any one of them matches. The
//! matched form is reported by name for auditing.

use std::collections::HashSet;

use secrecy::{ExposeSecret, Secret};
use serde_json::{Map, Value};
use service_core::utils::signature::{
    hex_digests_match, hmac_sha256_hex, hmac_sha512_hex, payload_fingerprint,
};
use thiserror::Error;

/// Query fields that carry the signature itself.
const QUERY_HASH_FIELDS: [&str; 2] = ["vnp_SecureHash", "vnp_SecureHashType"];
/// Envelope fields describing transport status rather than the payment.
const TRANSPORT_FIELDS: [&str; 2] = ["code", "desc"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

/// Candidate canonical forms, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Canonicalization {
    /// Raw bytes of the `data` member as received.
    RawData,
    RawDataCompact,
    /// `data` re-serialized in its original key order.
    Stringified,
    StringifiedCompact,
    /// `data` re-serialized with recursively sorted keys.
    SortedKeys,
    /// `k=v&...` over the sorted keys of `data`.
    DataQuery,
    DataQueryWithoutTransport,
    /// `k=v&...` over the sorted top-level envelope keys.
    EnvelopeQuery,
    /// Sorted raw query parameters of a redirect.
    SortedQuery,
    SortedQueryPlus,
}

impl Canonicalization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Canonicalization::RawData => "raw_data",
            Canonicalization::RawDataCompact => "raw_data_compact",
            Canonicalization::Stringified => "stringified",
            Canonicalization::StringifiedCompact => "stringified_compact",
            Canonicalization::SortedKeys => "sorted_keys",
            Canonicalization::DataQuery => "data_query",
            Canonicalization::DataQueryWithoutTransport => "data_query_without_transport",
            Canonicalization::EnvelopeQuery => "envelope_query",
            Canonicalization::SortedQuery => "sorted_query",
            Canonicalization::SortedQueryPlus => "sorted_query_plus",
        }
    }
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signing secret is not configured")]
    MissingSecret,

    #[error("payload carries no signature")]
    MissingSignature,

    #[error("no canonical form matched the claimed signature")]
    Mismatch,

    #[error("digest computation failed: {0}")]
    Digest(anyhow::Error),
}

#[derive(Clone)]
pub struct SignatureVerifier {
    algorithm: HashAlgorithm,
    secret: Option<Secret<String>>,
}

impl SignatureVerifier {
    pub fn new(algorithm: HashAlgorithm, secret: Option<Secret<String>>) -> Self {
        let secret = secret.filter(|s| !s.expose_secret().is_empty());
        Self { algorithm, secret }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Hex digest of `payload` under this verifier's secret and algorithm.
    pub fn sign(&self, payload: &str) -> Result<String, SignatureError> {
        let secret = self.secret.as_ref().ok_or(SignatureError::MissingSecret)?;
        let key = secret.expose_secret().as_bytes();
        let digest = match self.algorithm {
            HashAlgorithm::Sha256 => hmac_sha256_hex(key, payload.as_bytes()),
            HashAlgorithm::Sha512 => hmac_sha512_hex(key, payload.as_bytes()),
        };
        digest.map_err(SignatureError::Digest)
    }

    /// Verify a JSON envelope whose `data` member was signed.
    pub fn verify_json_payload(
        &self,
        raw: &str,
        claimed: Option<&str>,
    ) -> Result<Canonicalization, SignatureError> {
        self.verify(raw, json_candidates(raw), claimed)
    }

    /// Verify redirect query parameters, given as raw (still percent-encoded)
    /// pairs in arrival order.
    pub fn verify_query(
        &self,
        pairs: &[(String, String)],
        claimed: Option<&str>,
    ) -> Result<Canonicalization, SignatureError> {
        let raw = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        self.verify(&raw, query_candidates(pairs), claimed)
    }

    fn verify(
        &self,
        raw: &str,
        candidates: Vec<(Canonicalization, String)>,
        claimed: Option<&str>,
    ) -> Result<Canonicalization, SignatureError> {
        if self.secret.is_none() {
            tracing::error!("Gateway signing secret is not configured; rejecting payload");
            return Err(SignatureError::MissingSecret);
        }

        let claimed = claimed
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(SignatureError::MissingSignature)?;

        for (form, candidate) in &candidates {
            let expected = self.sign(candidate)?;
            if hex_digests_match(&expected, claimed) {
                tracing::debug!(canonicalization = form.as_str(), "Gateway signature verified");
                return Ok(*form);
            }
        }

        tracing::warn!(
            payload_fingerprint = %payload_fingerprint(raw.as_bytes()),
            candidates = candidates.len(),
            "Gateway signature matched no canonical form"
        );
        Err(SignatureError::Mismatch)
    }
}

/// Candidate serializations of a JSON envelope's `data` member.
pub fn json_candidates(raw: &str) -> Vec<(Canonicalization, String)> {
    let mut candidates = Candidates::default();

    if let Some(data) = raw_member(raw, "data") {
        candidates.push(Canonicalization::RawData, data.to_string());
        candidates.push(Canonicalization::RawDataCompact, strip_whitespace(data));
    }

    let Ok(Value::Object(envelope)) = serde_json::from_str::<Value>(raw) else {
        return candidates.into_inner();
    };

    if let Some(data) = envelope.get("data") {
        if let Ok(stringified) = serde_json::to_string(data) {
            let compact = strip_whitespace(&stringified);
            candidates.push(Canonicalization::Stringified, stringified);
            candidates.push(Canonicalization::StringifiedCompact, compact);
        }
        if let Ok(sorted) = serde_json::to_string(&sort_keys(data)) {
            candidates.push(Canonicalization::SortedKeys, sorted);
        }
        if let Value::Object(fields) = data {
            candidates.push(Canonicalization::DataQuery, object_query(fields, &[]));
            candidates.push(
                Canonicalization::DataQueryWithoutTransport,
                object_query(fields, &TRANSPORT_FIELDS),
            );
        }
    }

    candidates.push(
        Canonicalization::EnvelopeQuery,
        object_query(&envelope, &["signature", "code", "desc"]),
    );

    candidates.into_inner()
}

/// Candidate serializations of redirect query parameters.
pub fn query_candidates(pairs: &[(String, String)]) -> Vec<(Canonicalization, String)> {
    let mut signed: Vec<&(String, String)> = pairs
        .iter()
        .filter(|(k, v)| !v.is_empty() && !QUERY_HASH_FIELDS.contains(&k.as_str()))
        .collect();
    signed.sort_by(|a, b| a.0.cmp(&b.0));

    let sorted = signed
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let plus = sorted.replace("%20", "+");
    let mut candidates = Candidates::default();
    candidates.push(Canonicalization::SortedQuery, sorted);
    candidates.push(Canonicalization::SortedQueryPlus, plus);
    candidates.into_inner()
}

/// Ordered candidate list that drops byte-identical repeats.
#[derive(Default)]
struct Candidates {
    seen: HashSet<String>,
    items: Vec<(Canonicalization, String)>,
}

impl Candidates {
    fn push(&mut self, form: Canonicalization, value: String) {
        if self.seen.insert(value.clone()) {
            self.items.push((form, value));
        }
    }

    fn into_inner(self) -> Vec<(Canonicalization, String)> {
        self.items
    }
}

fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut keys: Vec<&String> = fields.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&fields[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

fn object_query(fields: &Map<String, Value>, excluded: &[&str]) -> String {
    let mut keys: Vec<&String> = fields
        .keys()
        .filter(|k| !excluded.contains(&k.as_str()))
        .collect();
    keys.sort();
    keys.iter()
        .map(|k| format!("{}={}", k, query_value(&fields[k.as_str()])))
        .collect::<Vec<_>>()
        .join("&")
}

fn query_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        nested => serde_json::to_string(nested).unwrap_or_default(),
    }
}

/// Locate the raw text of a top-level member's value without parsing the
/// document, so it can be hashed byte-for-byte.
fn raw_member<'a>(raw: &'a str, name: &str) -> Option<&'a str> {
    let bytes = raw.as_bytes();
    let mut i = skip_ws(bytes, 0);
    if bytes.get(i) != Some(&b'{') {
        return None;
    }
    i += 1;

    loop {
        i = skip_ws(bytes, i);
        match bytes.get(i)? {
            b'}' => return None,
            b'"' => {}
            _ => return None,
        }
        let key_end = string_end(bytes, i)?;
        let key = &raw[i + 1..key_end - 1];

        i = skip_ws(bytes, key_end);
        if bytes.get(i) != Some(&b':') {
            return None;
        }
        let start = skip_ws(bytes, i + 1);
        let end = value_end(bytes, start)?;
        if key == name {
            return Some(&raw[start..end]);
        }

        i = skip_ws(bytes, end);
        match bytes.get(i)? {
            b',' => i += 1,
            _ => return None,
        }
    }
}

fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// Index just past the closing quote of the string starting at `start`.
fn string_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

/// Index just past the JSON value starting at `start`.
fn value_end(bytes: &[u8], start: usize) -> Option<usize> {
    match bytes.get(start)? {
        b'"' => string_end(bytes, start),
        b'{' | b'[' => {
            let mut depth = 0usize;
            let mut i = start;
            while i < bytes.len() {
                match bytes[i] {
                    b'"' => {
                        i = string_end(bytes, i)?;
                        continue;
                    }
                    b'{' | b'[' => depth += 1,
                    b'}' | b']' => {
                        depth -= 1;
                        if depth == 0 {
                            return Some(i + 1);
                        }
                    }
                    _ => {}
                }
                i += 1;
            }
            None
        }
        _ => {
            let mut i = start;
            while i < bytes.len()
                && !matches!(bytes[i], b',' | b'}' | b']')
                && !bytes[i].is_ascii_whitespace()
            {
                i += 1;
            }
            (i > start).then_some(i)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "payos-checksum-key";

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(HashAlgorithm::Sha256, Some(Secret::new(KEY.to_string())))
    }

    fn envelope(signature: &str) -> String {
        format!(
            r#"{{"code":"00","desc":"success","success":true,"data": {{"orderCode": 123456789012, "amount": 200000, "description": "thanh toan", "reference": "TXN1", "counterAccountName": null}},"signature":"{}"}}"#,
            signature
        )
    }

    #[test]
    fn raw_member_finds_nested_object_verbatim() {
        let raw = r#"{ "code" : "00", "data" : {"a": "}\"", "b": [1, {"c": 2}]} , "signature": "x"}"#;
        assert_eq!(
            raw_member(raw, "data"),
            Some(r#"{"a": "}\"", "b": [1, {"c": 2}]}"#)
        );
        assert_eq!(raw_member(raw, "code"), Some(r#""00""#));
        assert_eq!(raw_member(raw, "missing"), None);
    }

    #[test]
    fn accepts_sorted_data_query_signature() {
        let v = verifier();
        let signed = "amount=200000&counterAccountName=&description=thanh toan&orderCode=123456789012&reference=TXN1";
        let signature = v.sign(signed).unwrap();

        let matched = v
            .verify_json_payload(&envelope(&signature), Some(&signature))
            .unwrap();
        assert_eq!(matched, Canonicalization::DataQuery);
    }

    #[test]
    fn accepts_raw_data_signature_and_reports_it() {
        let v = verifier();
        let raw = envelope("");
        let data = raw_member(&raw, "data").unwrap();
        let signature = v.sign(data).unwrap();

        let matched = v.verify_json_payload(&raw, Some(&signature)).unwrap();
        assert_eq!(matched, Canonicalization::RawData);
    }

    #[test]
    fn accepts_uppercase_hex() {
        let v = verifier();
        let raw = envelope("");
        let signature = v.sign(&strip_whitespace(raw_member(&raw, "data").unwrap())).unwrap();

        let matched = v
            .verify_json_payload(&raw, Some(&signature.to_uppercase()))
            .unwrap();
        assert_eq!(matched, Canonicalization::RawDataCompact);
    }

    #[test]
    fn single_byte_change_in_amount_is_rejected() {
        let v = verifier();
        let raw = envelope("");
        let signature = v.sign(raw_member(&raw, "data").unwrap()).unwrap();

        let tampered = raw.replace("\"amount\": 200000", "\"amount\": 900000");
        assert_ne!(tampered, raw);
        assert!(matches!(
            v.verify_json_payload(&tampered, Some(&signature)),
            Err(SignatureError::Mismatch)
        ));
    }

    #[test]
    fn missing_secret_fails_closed() {
        let v = SignatureVerifier::new(HashAlgorithm::Sha256, None);
        assert!(matches!(
            v.verify_json_payload(&envelope("abc"), Some("abc")),
            Err(SignatureError::MissingSecret)
        ));

        let blank = SignatureVerifier::new(HashAlgorithm::Sha256, Some(Secret::new(String::new())));
        assert!(!blank.is_configured());
    }

    #[test]
    fn missing_signature_is_rejected() {
        assert!(matches!(
            verifier().verify_json_payload(&envelope(""), None),
            Err(SignatureError::MissingSignature)
        ));
        assert!(matches!(
            verifier().verify_json_payload(&envelope(""), Some("  ")),
            Err(SignatureError::MissingSignature)
        ));
    }

    #[test]
    fn malformed_json_only_offers_raw_candidates() {
        let raw = r#"{"data": {"orderCode": 1, "amount": 5}, "signature": "#;
        let candidates = json_candidates(raw);
        let forms: Vec<_> = candidates.iter().map(|(f, _)| *f).collect();
        assert_eq!(
            forms,
            vec![Canonicalization::RawData, Canonicalization::RawDataCompact]
        );

        let v = verifier();
        let signature = v.sign(r#"{"orderCode": 1, "amount": 5}"#).unwrap();
        assert_eq!(
            v.verify_json_payload(raw, Some(&signature)).unwrap(),
            Canonicalization::RawData
        );
    }

    #[test]
    fn candidates_are_ordered_and_deduplicated() {
        // Compact input: raw, compact and stringified forms coincide.
        let raw = r#"{"code":"00","desc":"ok","data":{"b":1,"a":2},"signature":"s"}"#;
        let forms: Vec<_> = json_candidates(raw).into_iter().map(|(f, _)| f).collect();
        assert_eq!(
            forms,
            vec![
                Canonicalization::RawData,
                Canonicalization::SortedKeys,
                Canonicalization::DataQuery,
                Canonicalization::EnvelopeQuery,
            ]
        );
    }

    #[test]
    fn stringified_preserves_insertion_order() {
        let raw = r#"{"data": {"b": "x y", "a": {"d": 1, "c": 2}}}"#;
        let candidates = json_candidates(raw);
        let stringified = candidates
            .iter()
            .find(|(f, _)| *f == Canonicalization::Stringified)
            .map(|(_, s)| s.as_str());
        let sorted = candidates
            .iter()
            .find(|(f, _)| *f == Canonicalization::SortedKeys)
            .map(|(_, s)| s.as_str());
        assert_eq!(stringified, Some(r#"{"b":"x y","a":{"d":1,"c":2}}"#));
        assert_eq!(sorted, Some(r#"{"a":{"c":2,"d":1},"b":"x y"}"#));
    }

    #[test]
    fn query_candidates_exclude_hash_fields_and_fold_spaces() {
        let pairs = vec![
            ("vnp_TxnRef".to_string(), "123456789012".to_string()),
            ("vnp_OrderInfo".to_string(), "Thanh%20toan".to_string()),
            ("vnp_Amount".to_string(), "20000000".to_string()),
            ("vnp_BankTranNo".to_string(), String::new()),
            ("vnp_SecureHashType".to_string(), "HmacSHA512".to_string()),
            ("vnp_SecureHash".to_string(), "abc".to_string()),
        ];
        let candidates = query_candidates(&pairs);
        assert_eq!(
            candidates,
            vec![
                (
                    Canonicalization::SortedQuery,
                    "vnp_Amount=20000000&vnp_OrderInfo=Thanh%20toan&vnp_TxnRef=123456789012"
                        .to_string()
                ),
                (
                    Canonicalization::SortedQueryPlus,
                    "vnp_Amount=20000000&vnp_OrderInfo=Thanh+toan&vnp_TxnRef=123456789012"
                        .to_string()
                ),
            ]
        );
    }

    #[test]
    fn sha512_query_verification() {
        let v = SignatureVerifier::new(
            HashAlgorithm::Sha512,
            Some(Secret::new("vnpay-hash-secret".to_string())),
        );
        let pairs = vec![
            ("vnp_Amount".to_string(), "20000000".to_string()),
            ("vnp_OrderInfo".to_string(), "Thanh+toan".to_string()),
        ];
        let signature = v.sign("vnp_Amount=20000000&vnp_OrderInfo=Thanh+toan").unwrap();
        assert_eq!(signature.len(), 128);
        assert_eq!(
            v.verify_query(&pairs, Some(&signature)).unwrap(),
            Canonicalization::SortedQuery
        );
    }
}
