//! Actor Directory access
//!
//! Fetches remote actor documents to obtain `publicKey.publicKeyPem`.
//! This is the only network call made on the inbound verification path.

use std::net::IpAddr;
use std::time::Duration;

use crate::error::AppError;

/// Source of remote actor public keys
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ActorDirectory: Send + Sync {
    /// Fetch the PEM public key published under `key_id`
    ///
    /// # Errors
    /// `KeyResolution` for network errors, non-success responses, and actor
    /// documents without a usable key. Refused hosts surface as
    /// `Unauthorized`.
    async fn fetch_public_key(&self, key_id: &str) -> Result<String, AppError>;
}

/// Actor directory backed by plain HTTPS GETs
#[derive(Debug, Clone)]
pub struct HttpActorDirectory {
    http_client: reqwest::Client,
    allow_private_hosts: bool,
}

impl HttpActorDirectory {
    /// Create a directory client with a bounded fetch timeout
    ///
    /// `allow_private_hosts` disables the loopback/private address guard;
    /// only meant for local development and tests.
    pub fn new(
        timeout: Duration,
        user_agent: &str,
        allow_private_hosts: bool,
    ) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http_client,
            allow_private_hosts,
        })
    }

    pub fn with_client(http_client: reqwest::Client, allow_private_hosts: bool) -> Self {
        Self {
            http_client,
            allow_private_hosts,
        }
    }
}

#[async_trait::async_trait]
impl ActorDirectory for HttpActorDirectory {
    async fn fetch_public_key(&self, key_id: &str) -> Result<String, AppError> {
        // Validate actor URL/domain and extract actor document URL.
        let actor_url = key_id.split('#').next().unwrap_or(key_id);
        let parsed_actor_url = url::Url::parse(actor_url)
            .map_err(|e| AppError::KeyResolution(format!("Invalid actor URL: {}", e)))?;
        let actor_domain = extract_actor_domain(&parsed_actor_url, self.allow_private_hosts)?;

        if !self.allow_private_hosts {
            let actor_port = parsed_actor_url.port_or_known_default().ok_or_else(|| {
                AppError::KeyResolution("Missing port in actor URL".to_string())
            })?;
            // Hosts that look public may still resolve internally.
            validate_resolved_host_ips(&actor_domain, actor_port).await?;
        }

        let response = self
            .http_client
            .get(actor_url)
            .header("Accept", "application/activity+json")
            .send()
            .await
            .map_err(|e| AppError::KeyResolution(format!("Failed to fetch actor: {}", e)))?;

        // Only a plain 200 carries the actor document
        if response.status() != reqwest::StatusCode::OK {
            return Err(AppError::KeyResolution(format!(
                "Failed to fetch actor: HTTP {}",
                response.status()
            )));
        }

        let actor: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::KeyResolution(format!("Failed to parse actor: {}", e)))?;

        extract_public_key_pem(&actor, key_id)
    }
}

/// Pull `publicKey.publicKeyPem` out of an actor document
///
/// When `key_id` carries a fragment the actor must advertise exactly that
/// key id.
pub fn extract_public_key_pem(actor: &serde_json::Value, key_id: &str) -> Result<String, AppError> {
    let public_key = actor
        .get("publicKey")
        .ok_or_else(|| AppError::KeyResolution("Missing publicKey in actor".to_string()))?;

    if key_id.contains('#') {
        let advertised_key_id = public_key
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| AppError::KeyResolution("Missing publicKey.id in actor".to_string()))?;

        if advertised_key_id != key_id {
            return Err(AppError::KeyResolution(
                "Signature keyId does not match actor public key id".to_string(),
            ));
        }
    }

    public_key
        .get("publicKeyPem")
        .and_then(|pem| pem.as_str())
        .map(str::to_string)
        .ok_or_else(|| AppError::KeyResolution("Missing publicKeyPem in actor".to_string()))
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_end_matches('.')
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Reject non-HTTP(S) actor URLs and obvious local/private hosts
fn extract_actor_domain(url: &url::Url, allow_private_hosts: bool) -> Result<String, AppError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::KeyResolution(format!(
                "Unsupported actor URL scheme: {}",
                scheme
            )));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| AppError::KeyResolution("Missing host in actor URL".to_string()))?
        .to_ascii_lowercase();

    if !allow_private_hosts && is_disallowed_host(&host) {
        tracing::warn!(host = %host, "Refusing to fetch actor from local or private host");
        return Err(AppError::Unauthorized);
    }

    Ok(host)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::KeyResolution(format!("Failed to resolve actor host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            tracing::warn!(host = %normalized, "Actor host resolves to a private address");
            return Err(AppError::Unauthorized);
        }
    }

    if !resolved_any {
        return Err(AppError::KeyResolution(
            "No DNS records for actor host".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn url(raw: &str) -> url::Url {
        url::Url::parse(raw).unwrap()
    }

    #[test]
    fn extract_actor_domain_rejects_localhost_and_private_ips() {
        for raw in [
            "https://localhost/users/alice",
            "http://192.168.1.10/users/alice",
            "http://127.0.0.1:8080/users/alice",
            "http://[::1]/users/alice",
        ] {
            match extract_actor_domain(&url(raw), false) {
                Err(AppError::Unauthorized) => {}
                other => panic!("expected refusal for {raw}, got: {other:?}"),
            }
        }
    }

    #[test]
    fn extract_actor_domain_allows_private_hosts_when_configured() {
        let domain = extract_actor_domain(&url("http://127.0.0.1:8080/users/alice"), true)
            .expect("private host allowed");
        assert_eq!(domain, "127.0.0.1");
    }

    #[test]
    fn extract_actor_domain_rejects_non_http_schemes() {
        assert!(matches!(
            extract_actor_domain(&url("ftp://example.com/users/alice"), false),
            Err(AppError::KeyResolution(_))
        ));
    }

    #[tokio::test]
    async fn validate_resolved_host_ips_rejects_loopback() {
        match validate_resolved_host_ips("127.0.0.1", 80).await {
            Err(AppError::Unauthorized) => {}
            other => panic!("expected refusal for loopback resolution, got: {other:?}"),
        }
    }

    #[test]
    fn extract_public_key_pem_checks_advertised_key_id() {
        let actor = json!({
            "id": "https://remote.example/users/alice",
            "publicKey": {
                "id": "https://remote.example/users/alice#main-key",
                "owner": "https://remote.example/users/alice",
                "publicKeyPem": "-----BEGIN PUBLIC KEY-----\n..."
            }
        });

        assert!(
            extract_public_key_pem(&actor, "https://remote.example/users/alice#main-key").is_ok()
        );
        assert!(matches!(
            extract_public_key_pem(&actor, "https://remote.example/users/alice#other-key"),
            Err(AppError::KeyResolution(_))
        ));
    }

    #[test]
    fn extract_public_key_pem_requires_pem_field() {
        let actor = json!({"publicKey": {"id": "https://remote.example/users/alice#main-key"}});
        match extract_public_key_pem(&actor, "https://remote.example/users/alice#main-key") {
            Err(AppError::KeyResolution(msg)) => assert!(msg.contains("publicKeyPem")),
            other => panic!("expected missing publicKeyPem, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn refused_host_is_never_contacted() {
        let directory = HttpActorDirectory::new(Duration::from_secs(1), "test", false).unwrap();
        assert!(matches!(
            directory
                .fetch_public_key("http://127.0.0.1:9/users/alice#main-key")
                .await,
            Err(AppError::Unauthorized)
        ));
    }

    /// Serve `actor` for every GET with the given status
    async fn actor_server(status: axum::http::StatusCode, actor: serde_json::Value) -> String {
        let app = axum::Router::new().route(
            "/users/:username",
            axum::routing::get(move || {
                let actor = actor.clone();
                async move { (status, axum::Json(actor)) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn actor_document() -> serde_json::Value {
        json!({
            "type": "Person",
            "publicKey": {"publicKeyPem": "-----BEGIN PUBLIC KEY-----"}
        })
    }

    #[tokio::test]
    async fn fetches_key_from_ok_response() {
        let base = actor_server(axum::http::StatusCode::OK, actor_document()).await;
        let directory = HttpActorDirectory::new(Duration::from_secs(5), "test", true).unwrap();

        let pem = directory
            .fetch_public_key(&format!("{}/users/alice", base))
            .await
            .unwrap();
        assert_eq!(pem, "-----BEGIN PUBLIC KEY-----");
    }

    #[tokio::test]
    async fn non_200_success_status_is_not_found() {
        let base = actor_server(
            axum::http::StatusCode::NON_AUTHORITATIVE_INFORMATION,
            actor_document(),
        )
        .await;
        let directory = HttpActorDirectory::new(Duration::from_secs(5), "test", true).unwrap();

        match directory
            .fetch_public_key(&format!("{}/users/alice", base))
            .await
        {
            Err(AppError::KeyResolution(msg)) => assert!(msg.contains("203")),
            other => panic!("expected key resolution failure, got: {other:?}"),
        }
    }
}
