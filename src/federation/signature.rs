//! HTTP Signatures for ActivityPub
//!
//! Implements the signing half per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! The signing string is built from `(request-target)`, `host`, `date` and,
//! for requests with a body, `digest`, joined by `\n` with no trailing
//! newline. Signatures are RSASSA-PKCS1-v1_5 over SHA-256.

use std::fmt;
use std::path::Path;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Value of the `algorithm` signature parameter we emit
pub const ALGORITHM: &str = "rsa-sha256";

/// Pseudo-header naming the lowercased method and request path
pub const REQUEST_TARGET: &str = "(request-target)";

/// RFC 7231 IMF-fixdate, always in GMT
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// The local actor's signing key
///
/// Owned by the signing process only; `Debug` never prints key material
/// and there is no way to serialize the private half.
#[derive(Clone)]
pub struct LocalActorKey {
    key_id: String,
    signing_key: rsa::pkcs1v15::SigningKey<Sha256>,
    public_key: RsaPublicKey,
}

impl LocalActorKey {
    /// Parse a PEM private key (PKCS#8 or PKCS#1)
    ///
    /// # Errors
    /// `Signing` if the PEM is not an RSA private key
    pub fn from_pem(key_id: impl Into<String>, private_key_pem: &str) -> Result<Self, AppError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem))
            .map_err(|e| AppError::Signing(format!("Invalid private key: {}", e)))?;
        let public_key = RsaPublicKey::from(&private_key);

        Ok(Self {
            key_id: key_id.into(),
            signing_key: rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key),
            public_key,
        })
    }

    /// Read and parse a PEM private key file
    pub fn from_file(key_id: impl Into<String>, path: &Path) -> Result<Self, AppError> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            AppError::Signing(format!(
                "Failed to read private key {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_pem(key_id, &pem)
    }

    /// Full URL of the published key (actor#main-key)
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// SPKI PEM of the public half, as published in the actor document
    pub fn public_key_pem(&self) -> Result<String, AppError> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Signing(format!("Failed to encode public key: {}", e)))
    }

    pub(crate) fn sign_bytes(&self, data: &[u8]) -> Result<Vec<u8>, AppError> {
        use rsa::signature::{RandomizedSigner, SignatureEncoding};

        let mut rng = rand::thread_rng();
        let signature = self
            .signing_key
            .try_sign_with_rng(&mut rng, data)
            .map_err(|e| AppError::Signing(format!("RSA signing failed: {}", e)))?;
        Ok(signature.to_vec())
    }
}

impl fmt::Debug for LocalActorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalActorKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Parse a PEM public key (SPKI or PKCS#1)
pub fn parse_public_key_pem(public_key_pem: &str) -> Result<RsaPublicKey, AppError> {
    RsaPublicKey::from_public_key_pem(public_key_pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_key_pem))
        .map_err(|e| AppError::Validation(format!("Invalid public key: {}", e)))
}

/// Headers to add for signed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeaders {
    /// Date header value (RFC 7231)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
    /// Signature header value
    pub signature: String,
    /// Exact string that was signed
    pub signing_string: String,
}

impl SignatureHeaders {
    /// Header map `{Date, Digest?, Signature}`
    pub fn to_header_map(&self) -> Result<http::HeaderMap, AppError> {
        use http::header::{DATE, HeaderValue};

        let value = |raw: &str| {
            HeaderValue::from_str(raw)
                .map_err(|e| AppError::Signing(format!("Invalid header value: {}", e)))
        };

        let mut headers = http::HeaderMap::new();
        headers.insert(DATE, value(&self.date)?);
        if let Some(digest) = &self.digest {
            headers.insert("digest", value(digest)?);
        }
        headers.insert("signature", value(&self.signature)?);
        Ok(headers)
    }

    /// Attach the signature headers to an outgoing request
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut request = request
            .header("Date", &self.date)
            .header("Signature", &self.signature);
        if let Some(digest) = &self.digest {
            request = request.header("Digest", digest);
        }
        request
    }
}

/// Current time as an HTTP `Date` header value
pub fn http_date_now() -> String {
    chrono::Utc::now().format(HTTP_DATE_FORMAT).to_string()
}

/// Sign a request described by method, path, and host
///
/// A fresh `Date` is generated on every call.
///
/// # Example
/// ```ignore
/// let headers = sign(&key, "POST", "/users/alice/inbox", "remote.example", &body)?;
/// ```
pub fn sign(
    key: &LocalActorKey,
    method: &str,
    path: &str,
    host: &str,
    body: &[u8],
) -> Result<SignatureHeaders, AppError> {
    sign_at(key, method, path, host, body, &http_date_now())
}

/// Sign with a caller-supplied `Date` value
///
/// Deterministic for a given key and input, which makes signing strings
/// reproducible. Outbound deliveries go through [`sign`].
pub fn sign_at(
    key: &LocalActorKey,
    method: &str,
    path: &str,
    host: &str,
    body: &[u8],
    date: &str,
) -> Result<SignatureHeaders, AppError> {
    // 1. Digest only when there is a body
    let digest = (!body.is_empty()).then(|| generate_digest(body));

    // 2. Fixed header order
    let request_target = format!("{} {}", method.to_lowercase(), path);
    let mut signed: Vec<(&str, &str)> = vec![
        (REQUEST_TARGET, request_target.as_str()),
        ("host", host),
        ("date", date),
    ];
    if let Some(digest_value) = digest.as_deref() {
        signed.push(("digest", digest_value));
    }

    let signing_string = build_signing_string(&signed);
    let headers_list: Vec<&str> = signed.iter().map(|(name, _)| *name).collect();

    // 3. RSA-SHA256
    let signature_b64 = BASE64.encode(key.sign_bytes(signing_string.as_bytes())?);

    // 4. Signature header
    let signature = format!(
        "keyId=\"{}\",algorithm=\"{}\",headers=\"{}\",signature=\"{}\"",
        key.key_id(),
        ALGORITHM,
        headers_list.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        date: date.to_string(),
        digest,
        signature,
        signing_string,
    })
}

/// Sign an HTTP request for a full URL
///
/// Derives the path (with query) and host (with port when it is not the
/// scheme default) from `url`.
pub fn sign_request(
    key: &LocalActorKey,
    method: &str,
    url: &url::Url,
    body: Option<&[u8]>,
) -> Result<SignatureHeaders, AppError> {
    let (host, path_and_query) = request_host_and_path(url)?;
    sign(key, method, &path_and_query, &host, body.unwrap_or_default())
}

/// Host header value and request path for a URL
pub fn request_host_and_path(url: &url::Url) -> Result<(String, String), AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    let host = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let path_and_query = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };

    Ok((host, path_and_query))
}

/// Join `name: value` lines with `\n`, no trailing newline
pub fn build_signing_string(lines: &[(&str, &str)]) -> String {
    lines
        .iter()
        .map(|(name, value)| format!("{}: {}", name, value))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Parsed Signature header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names, lowercased, in declared order
    pub headers: Vec<String>,
    /// Decoded signature bytes
    pub signature: Vec<u8>,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// # Errors
/// `Validation` naming the first missing or undecodable parameter
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in split_parameters(header) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');

        match key.trim() {
            "keyId" => key_id = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_ascii_lowercase()),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(|s| s.to_ascii_lowercase())
                        .collect::<Vec<_>>(),
                )
            }
            "signature" => signature = Some(value.to_string()),
            _ => {} // Ignore unknown fields
        }
    }

    let missing = |name: &str| AppError::Validation(format!("Missing {}", name));

    let key_id = key_id.filter(|v| !v.is_empty()).ok_or_else(|| missing("keyId"))?;
    let algorithm = algorithm
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing("algorithm"))?;
    let headers = headers
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing("headers"))?;
    let signature = signature
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing("signature"))?;
    let signature = BASE64
        .decode(signature)
        .map_err(|_| AppError::Validation("Invalid signature encoding".to_string()))?;

    Ok(ParsedSignature {
        key_id,
        algorithm,
        headers,
        signature,
    })
}

/// Split `a="x",b="y"` on commas that are outside quotes
fn split_parameters(header: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (idx, ch) in header.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(header[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(header[start..].trim());

    parts.into_iter().filter(|p| !p.is_empty()).collect()
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}
