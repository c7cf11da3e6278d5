//! Registry authentication.
//!
//! Requests go out with Basic credentials when available. A 401 carrying a
//! `WWW-Authenticate: Bearer` challenge triggers a token-service exchange;
//! the resulting token is cached per host and the request is replayed once.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use kitforge_core::{KitError, Result};
use tokio::sync::Mutex;
use url::Url;

use super::credentials::CredentialSource;
use super::transport::{HttpRequest, HttpResponse, HttpTransport, Method};

const AUTHORIZATION: &str = "Authorization";

/// Transport wrapper that injects and refreshes registry credentials.
pub struct AuthClient {
    transport: Arc<dyn HttpTransport>,
    credentials: Arc<dyn CredentialSource>,
    tokens: Mutex<HashMap<String, String>>,
}

impl AuthClient {
    pub fn new(transport: Arc<dyn HttpTransport>, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            transport,
            credentials,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Execute a request with authentication.
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.send_with_auth(request).await.map(|(response, _)| response)
    }

    /// Execute a request with authentication, also returning the
    /// `Authorization` header that was used. Upload sessions replay that
    /// header on every subsequent request.
    pub async fn send_with_auth(
        &self,
        mut request: HttpRequest,
    ) -> Result<(HttpResponse, Option<String>)> {
        let host = host_key(&request.url);

        let mut auth_header = match self.tokens.lock().await.get(&host) {
            Some(token) => Some(token.clone()),
            None => self.basic_header(&host)?,
        };
        if let Some(header) = &auth_header {
            request.remove_header(AUTHORIZATION);
            request = request.header(AUTHORIZATION, header.clone());
        }

        let response = self.transport.execute(request.clone()).await?;
        if response.status != 401 {
            return Ok((response, auth_header));
        }

        let Some(challenge) = response
            .header("www-authenticate")
            .and_then(parse_bearer_challenge)
        else {
            return Ok((response, auth_header));
        };

        tracing::debug!(host = %host, realm = %challenge.realm, "Fetching registry token");
        let token = self.fetch_token(&challenge, &host).await?;
        let header = format!("Bearer {}", token);
        self.tokens.lock().await.insert(host, header.clone());

        request.remove_header(AUTHORIZATION);
        request = request.header(AUTHORIZATION, header.clone());
        auth_header = Some(header);
        let retried = self.transport.execute(request).await?;
        Ok((retried, auth_header))
    }

    fn basic_header(&self, host: &str) -> Result<Option<String>> {
        let Some(credential) = self.credentials.get(host)? else {
            return Ok(None);
        };
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", credential.username, credential.password));
        Ok(Some(format!("Basic {}", encoded)))
    }

    async fn fetch_token(&self, challenge: &BearerChallenge, host: &str) -> Result<String> {
        let mut url = Url::parse(&challenge.realm).map_err(|e| {
            KitError::Network(format!("invalid token realm '{}': {}", challenge.realm, e))
        })?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = &challenge.service {
                query.append_pair("service", service);
            }
            if let Some(scope) = &challenge.scope {
                query.append_pair("scope", scope);
            }
        }

        let mut request = HttpRequest::new(Method::Get, url);
        if let Some(basic) = self.basic_header(host)? {
            request = request.header(AUTHORIZATION, basic);
        }

        let response = self.transport.execute(request).await?;
        if !response.is_success() {
            return Err(KitError::Server {
                status: response.status,
                message: format!("token service refused authentication: {}", response.body_text()),
            });
        }

        let token: TokenResponse = serde_json::from_slice(&response.body)
            .map_err(|e| KitError::Network(format!("malformed token response: {}", e)))?;
        token
            .token
            .or(token.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| KitError::Network("token service returned no token".to_string()))
    }
}

#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, PartialEq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

fn host_key(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    }
}

/// Parse a `WWW-Authenticate: Bearer realm="...",service="...",scope="..."`
/// challenge header.
fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let rest = header.trim().strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for part in rest.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        let value = value.trim_matches('"').to_string();
        match key.trim() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::credentials::NoCredentials;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct ScriptedTransport {
        responses: StdMutex<Vec<HttpResponse>>,
        requests: StdMutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<HttpResponse>) -> Self {
            Self {
                responses: StdMutex::new(responses),
                requests: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(KitError::Network("no scripted response".to_string()));
            }
            Ok(responses.remove(0))
        }
    }

    fn response(status: u16, headers: &[(&str, &str)], body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let parsed = parse_bearer_challenge(
            r#"Bearer realm="https://auth.example/token",service="registry.example",scope="repository:repo:pull""#,
        )
        .unwrap();
        assert_eq!(parsed.realm, "https://auth.example/token");
        assert_eq!(parsed.service.as_deref(), Some("registry.example"));
        assert_eq!(parsed.scope.as_deref(), Some("repository:repo:pull"));
    }

    #[test]
    fn test_parse_bearer_challenge_rejects_basic() {
        assert!(parse_bearer_challenge(r#"Basic realm="registry""#).is_none());
    }

    #[tokio::test]
    async fn test_passthrough_without_challenge() {
        let transport = Arc::new(ScriptedTransport::new(vec![response(200, &[], "ok")]));
        let client = AuthClient::new(transport.clone(), Arc::new(NoCredentials));
        let url = Url::parse("https://registry.example/v2/").unwrap();
        let (resp, auth) = client
            .send_with_auth(HttpRequest::new(Method::Get, url))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert!(auth.is_none());
    }

    #[tokio::test]
    async fn test_token_exchange_on_challenge() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            response(
                401,
                &[(
                    "Www-Authenticate",
                    r#"Bearer realm="https://auth.example/token",service="reg""#,
                )],
                "",
            ),
            response(200, &[], r#"{"token":"abc123"}"#),
            response(200, &[], "ok"),
        ]));
        let client = AuthClient::new(transport.clone(), Arc::new(NoCredentials));
        let url = Url::parse("https://registry.example/v2/repo/manifests/tag").unwrap();
        let (resp, auth) = client
            .send_with_auth(HttpRequest::new(Method::Get, url))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(auth.as_deref(), Some("Bearer abc123"));

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        // Token request goes to the realm with the service attached
        assert!(requests[1].url.as_str().starts_with("https://auth.example/token"));
        assert!(requests[1].url.as_str().contains("service=reg"));
        // Replayed request carries the bearer token
        assert_eq!(
            requests[2].header_value("Authorization"),
            Some("Bearer abc123")
        );
    }

    #[tokio::test]
    async fn test_cached_token_is_reused() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            response(
                401,
                &[(
                    "Www-Authenticate",
                    r#"Bearer realm="https://auth.example/token""#,
                )],
                "",
            ),
            response(200, &[], r#"{"access_token":"tok"}"#),
            response(200, &[], "ok"),
            response(200, &[], "ok again"),
        ]));
        let client = AuthClient::new(transport.clone(), Arc::new(NoCredentials));
        let url = Url::parse("https://registry.example/v2/").unwrap();
        client
            .send(HttpRequest::new(Method::Get, url.clone()))
            .await
            .unwrap();
        client.send(HttpRequest::new(Method::Get, url)).await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 4);
        assert_eq!(
            requests[3].header_value("Authorization"),
            Some("Bearer tok")
        );
    }
}
