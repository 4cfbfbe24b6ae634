//! Inbound HTTP Signature verification
//!
//! Every failure path is a rejection. Callers that only need a yes/no use
//! [`SignatureVerifier::verify`]; [`SignatureVerifier::check`] reports why.

use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, VerifyingKey};
use rsa::signature::Verifier;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::key_cache::KeyResolver;
use super::signature::{
    ParsedSignature, REQUEST_TARGET, build_signing_string, parse_public_key_pem,
    parse_signature_header,
};
use crate::metrics::SIGNATURE_VERIFICATIONS_TOTAL;

/// Algorithms accepted in the `algorithm` parameter
const ACCEPTED_ALGORITHMS: [&str; 2] = ["rsa-sha256", "hs2019"];

/// Why an inbound signature was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Malformed signature header: {0}")]
    MalformedSignatureHeader(String),

    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Signed header missing from request: {0}")]
    MissingHeader(String),

    #[error("Date header outside the accepted window: {0}")]
    StaleDate(String),

    #[error("Digest does not match body")]
    DigestMismatch,

    #[error("Key resolution failed: {0}")]
    KeyResolutionFailure(String),

    #[error("Signature does not match")]
    SignatureMismatch,
}

impl VerifyError {
    /// Short label used for the verification metric
    pub fn kind(&self) -> &'static str {
        match self {
            VerifyError::MalformedSignatureHeader(_) => "malformed_header",
            VerifyError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            VerifyError::MissingHeader(_) => "missing_header",
            VerifyError::StaleDate(_) => "stale_date",
            VerifyError::DigestMismatch => "digest_mismatch",
            VerifyError::KeyResolutionFailure(_) => "key_resolution_failure",
            VerifyError::SignatureMismatch => "signature_mismatch",
        }
    }
}

/// Checks applied on top of the cryptographic signature check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyPolicy {
    /// Maximum distance between the signed `Date` and now; `None` disables
    pub max_date_skew: Option<Duration>,
    /// Recompute the body digest and compare it with the `Digest` header
    pub require_digest_match: bool,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            max_date_skew: Some(Duration::from_secs(300)),
            require_digest_match: true,
        }
    }
}

impl VerifyPolicy {
    /// Only the signature itself; the `Digest` value is trusted as signed
    pub fn signature_only() -> Self {
        Self {
            max_date_skew: None,
            require_digest_match: false,
        }
    }
}

/// Verifies inbound signed requests
#[derive(Clone)]
pub struct SignatureVerifier {
    resolver: Arc<dyn KeyResolver>,
    policy: VerifyPolicy,
}

impl SignatureVerifier {
    pub fn new(resolver: Arc<dyn KeyResolver>, policy: VerifyPolicy) -> Self {
        Self { resolver, policy }
    }

    pub fn policy(&self) -> VerifyPolicy {
        self.policy
    }

    /// `true` only if the request carries a valid signature
    pub async fn verify(
        &self,
        method: &str,
        path: &str,
        headers: &http::HeaderMap,
        body: &[u8],
    ) -> bool {
        self.check(method, path, headers, body).await.is_ok()
    }

    /// Verify and return the accepted signature parameters
    ///
    /// # Steps
    /// 1. Parse the `Signature` header
    /// 2. Check algorithm, date freshness, and body digest
    /// 3. Resolve `keyId` to a public key
    /// 4. Rebuild the signing string in the declared header order
    /// 5. Verify RSASSA-PKCS1-v1_5 / SHA-256
    pub async fn check(
        &self,
        method: &str,
        path: &str,
        headers: &http::HeaderMap,
        body: &[u8],
    ) -> Result<ParsedSignature, VerifyError> {
        let result = self.check_inner(method, path, headers, body).await;

        match &result {
            Ok(parsed) => {
                SIGNATURE_VERIFICATIONS_TOTAL
                    .with_label_values(&["accepted"])
                    .inc();
                tracing::debug!(key_id = %parsed.key_id, "Signature verified");
            }
            Err(e) => {
                SIGNATURE_VERIFICATIONS_TOTAL
                    .with_label_values(&[e.kind()])
                    .inc();
                tracing::info!(method = %method, path = %path, reason = %e, "Rejected signed request");
            }
        }
        result
    }

    async fn check_inner(
        &self,
        method: &str,
        path: &str,
        headers: &http::HeaderMap,
        body: &[u8],
    ) -> Result<ParsedSignature, VerifyError> {
        // 1. Parse Signature header
        let signature_header = headers
            .get("signature")
            .ok_or_else(|| VerifyError::MalformedSignatureHeader("Missing Signature header".into()))?
            .to_str()
            .map_err(|_| VerifyError::MalformedSignatureHeader("Non-ASCII Signature header".into()))?;
        let parsed = parse_signature_header(signature_header)
            .map_err(|e| VerifyError::MalformedSignatureHeader(e.to_string()))?;

        // 2. Policy checks
        if !ACCEPTED_ALGORITHMS.contains(&parsed.algorithm.as_str()) {
            return Err(VerifyError::UnsupportedAlgorithm(parsed.algorithm));
        }
        if let Some(max_skew) = self.policy.max_date_skew {
            check_date(&parsed, headers, max_skew)?;
        }
        if self.policy.require_digest_match {
            check_digest(&parsed, headers, body)?;
        }

        // 3. Resolve key
        let public_key_pem = self
            .resolver
            .resolve(&parsed.key_id)
            .await
            .map_err(|e| VerifyError::KeyResolutionFailure(e.to_string()))?;

        // 4-5. Signing string and signature
        verify_with_key(method, path, headers, &parsed, &public_key_pem)?;

        Ok(parsed)
    }
}

/// Verify parsed signature parameters against a known public key
pub fn verify_with_key(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    parsed: &ParsedSignature,
    public_key_pem: &str,
) -> Result<(), VerifyError> {
    let signing_string = reconstruct_signing_string(method, path, headers, &parsed.headers)?;

    let public_key = parse_public_key_pem(public_key_pem)
        .map_err(|e| VerifyError::KeyResolutionFailure(e.to_string()))?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let signature = Pkcs1v15Signature::try_from(parsed.signature.as_slice())
        .map_err(|_| VerifyError::SignatureMismatch)?;

    verifying_key
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| VerifyError::SignatureMismatch)
}

/// Rebuild the signing string from the headers as received
///
/// Header names are taken in exactly the order the `headers` parameter
/// lists them. Repeated headers are joined with `, `.
pub fn reconstruct_signing_string(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    signed_headers: &[String],
) -> Result<String, VerifyError> {
    let request_target = format!("{} {}", method.to_lowercase(), path);
    let mut values = Vec::with_capacity(signed_headers.len());

    for name in signed_headers {
        if name == REQUEST_TARGET {
            values.push(request_target.clone());
            continue;
        }
        if name.starts_with('(') {
            return Err(VerifyError::MalformedSignatureHeader(format!(
                "Unsupported pseudo-header: {}",
                name
            )));
        }

        let received = headers
            .get_all(name.as_str())
            .iter()
            .map(|value| value.to_str().map(str::trim))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| VerifyError::MissingHeader(name.clone()))?;
        if received.is_empty() {
            return Err(VerifyError::MissingHeader(name.clone()));
        }
        values.push(received.join(", "));
    }

    let lines: Vec<(&str, &str)> = signed_headers
        .iter()
        .map(String::as_str)
        .zip(values.iter().map(String::as_str))
        .collect();
    Ok(build_signing_string(&lines))
}

fn is_signed(parsed: &ParsedSignature, name: &str) -> bool {
    parsed.headers.iter().any(|h| h == name)
}

fn check_date(
    parsed: &ParsedSignature,
    headers: &http::HeaderMap,
    max_skew: Duration,
) -> Result<(), VerifyError> {
    // Freshness only applies to a signed date
    if !is_signed(parsed, "date") {
        return Ok(());
    }

    let raw = headers
        .get(http::header::DATE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| VerifyError::MissingHeader("date".into()))?;
    let date = DateTime::parse_from_rfc2822(raw)
        .map_err(|_| VerifyError::StaleDate(format!("unparseable date {}", raw)))?
        .with_timezone(&Utc);

    let skew = (Utc::now() - date).num_seconds().unsigned_abs();
    if skew > max_skew.as_secs() {
        return Err(VerifyError::StaleDate(raw.to_string()));
    }
    Ok(())
}

fn check_digest(
    parsed: &ParsedSignature,
    headers: &http::HeaderMap,
    body: &[u8],
) -> Result<(), VerifyError> {
    if !is_signed(parsed, "digest") {
        return if body.is_empty() {
            Ok(())
        } else {
            Err(VerifyError::MissingHeader("digest".into()))
        };
    }

    let raw = headers
        .get("digest")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| VerifyError::MissingHeader("digest".into()))?;

    // A Digest header may list several algorithms; SHA-256 must be one.
    let claimed = raw
        .split(',')
        .filter_map(|part| part.trim().split_once('='))
        .find(|(algorithm, _)| algorithm.eq_ignore_ascii_case("sha-256"))
        .map(|(_, value)| value)
        .ok_or(VerifyError::DigestMismatch)?;

    let claimed = BASE64
        .decode(claimed)
        .map_err(|_| VerifyError::DigestMismatch)?;
    if claimed.as_slice() != Sha256::digest(body).as_slice() {
        return Err(VerifyError::DigestMismatch);
    }
    Ok(())
}
