//! Registry client tests against a scripted transport.

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kitforge_core::config::NetworkOptions;
use kitforge_core::{KitError, Result};
use kitforge_engine::digest;
use kitforge_engine::oci::Descriptor;
use kitforge_engine::remote::{
    Credential, CredentialSource, HttpRequest, HttpResponse, HttpTransport, Method, NoCredentials,
    Repository, RetryPolicy,
};
use kitforge_engine::{ops, Reference};

type Responder = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync>;

/// Transport that replays a scripted list of responses and records every
/// request it saw.
struct ScriptedTransport {
    responders: Mutex<Vec<Responder>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    fn new(responders: Vec<Responder>) -> Arc<Self> {
        Arc::new(Self {
            responders: Mutex::new(responders),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn recorded(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let mut responders = self.responders.lock().unwrap();
        if responders.is_empty() {
            return Err(KitError::Network(
                "test error: no scripted response left".to_string(),
            ));
        }
        let responder = responders.remove(0);
        responder(&request)
    }
}

fn response(status: u16, headers: &[(&str, &str)], body: &[u8]) -> HttpResponse {
    HttpResponse {
        status,
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        body: body.to_vec(),
    }
}

fn expect(
    method: Method,
    path: &'static str,
    result: HttpResponse,
) -> Responder {
    Box::new(move |request| {
        if request.method != method {
            return Err(KitError::Network(format!(
                "expected {} request, got {}",
                method.as_str(),
                request.method.as_str()
            )));
        }
        if request.url.path() != path {
            return Err(KitError::Network(format!(
                "unexpected path: expected '{}' but got '{}'",
                path,
                request.url.path()
            )));
        }
        Ok(result.clone())
    })
}

fn plain_http_opts() -> NetworkOptions {
    NetworkOptions {
        plain_http: true,
        ..Default::default()
    }
}

fn test_repository(transport: Arc<ScriptedTransport>) -> Repository {
    let reference = Reference::parse("registry.example/test/repo:v1").unwrap();
    Repository::new(transport, Arc::new(NoCredentials), reference, &plain_http_opts())
}

fn fast_retries(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        min_wait: Duration::from_millis(1),
        max_wait: Duration::from_millis(5),
    }
}

struct StaticCredentials;

impl CredentialSource for StaticCredentials {
    fn get(&self, _registry: &str) -> Result<Option<Credential>> {
        Ok(Some(Credential {
            username: "user".to_string(),
            password: "secret".to_string(),
        }))
    }
}

const CHUNK: i64 = 1024 * 1024;

fn blob_of_size(size: i64) -> (Vec<u8>, Descriptor) {
    let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let desc = Descriptor::new(
        "application/octet-stream",
        digest::sha256_digest(&content),
        size,
    );
    (content, desc)
}

#[tokio::test]
async fn test_chunked_upload_with_retry() {
    // 2 MiB + 1 KiB: three chunks at a 1 MiB chunk size. The first PATCH
    // hits a transient 500 and is retried against the same location.
    let size = 2 * CHUNK + 1024;
    let (content, desc) = blob_of_size(size);

    let responders: Vec<Responder> = vec![
        expect(
            Method::Post,
            "/v2/test/repo/blobs/uploads/",
            response(202, &[("Location", "/one")], b""),
        ),
        expect(Method::Patch, "/one", response(500, &[], b"transient")),
        expect(
            Method::Patch,
            "/one",
            response(
                202,
                &[("Location", "/two"), ("Range", "0-1048575")],
                b"",
            ),
        ),
        expect(
            Method::Patch,
            "/two",
            response(
                202,
                &[("Location", "/three"), ("Range", "0-2097151")],
                b"",
            ),
        ),
        expect(
            Method::Patch,
            "/three",
            response(
                202,
                &[("Location", "/four"), ("Range", "0-2098175")],
                b"",
            ),
        ),
        expect(
            Method::Put,
            "/four",
            response(201, &[("Location", "finalLocation")], b""),
        ),
    ];
    let transport = ScriptedTransport::new(responders);
    let repo = test_repository(transport.clone())
        .with_upload_chunk_size(CHUNK)
        .with_retry_policy(fast_retries(5));

    let mut reader = Cursor::new(content);
    let final_location = repo.push_blob(&desc, &mut reader).await.unwrap();
    assert_eq!(
        final_location, "finalLocation",
        "should return the location in the last response"
    );

    // Retried chunk resends the same range from the start
    let requests = transport.recorded();
    let patches: Vec<&HttpRequest> = requests
        .iter()
        .filter(|r| r.method == Method::Patch)
        .collect();
    assert_eq!(patches.len(), 4);
    assert_eq!(patches[0].header_value("Content-Range"), Some("0-1048575"));
    assert_eq!(patches[1].header_value("Content-Range"), Some("0-1048575"));
    assert_eq!(
        patches[2].header_value("Content-Range"),
        Some("1048576-2097151")
    );
    assert_eq!(
        patches[3].header_value("Content-Range"),
        Some("2097152-2098175")
    );
    assert_eq!(patches[0].body.as_ref().unwrap().len() as i64, CHUNK);
    assert_eq!(patches[3].body.as_ref().unwrap().len(), 1024);
    for patch in &patches {
        assert_eq!(
            patch.header_value("Content-Type"),
            Some("application/octet-stream")
        );
    }
    // The final PUT carries the digest query
    let put = requests
        .iter()
        .find(|r| r.method == Method::Put)
        .expect("finalize PUT");
    assert!(put.url.query().unwrap().contains("digest="));
}

#[tokio::test]
async fn test_chunked_upload_replays_auth_header() {
    let size = 2 * CHUNK;
    let (content, desc) = blob_of_size(size);

    let responders: Vec<Responder> = vec![
        expect(
            Method::Post,
            "/v2/test/repo/blobs/uploads/",
            response(202, &[("Location", "/one")], b""),
        ),
        expect(
            Method::Patch,
            "/one",
            response(202, &[("Location", "/two"), ("Range", "0-1048575")], b""),
        ),
        expect(
            Method::Patch,
            "/two",
            response(202, &[("Location", "/three"), ("Range", "0-2097151")], b""),
        ),
        expect(
            Method::Put,
            "/three",
            response(201, &[("Location", "/blob")], b""),
        ),
    ];
    let transport = ScriptedTransport::new(responders);
    let reference = Reference::parse("registry.example/test/repo:v1").unwrap();
    let repo = Repository::new(
        transport.clone(),
        Arc::new(StaticCredentials),
        reference,
        &plain_http_opts(),
    )
    .with_upload_chunk_size(CHUNK);

    let mut reader = Cursor::new(content);
    repo.push_blob(&desc, &mut reader).await.unwrap();

    let requests = transport.recorded();
    let post_auth = requests[0]
        .header_value("Authorization")
        .expect("POST carries credentials")
        .to_string();
    assert!(post_auth.starts_with("Basic "));
    for request in &requests[1..] {
        assert_eq!(
            request.header_value("Authorization"),
            Some(post_auth.as_str()),
            "session requests should replay the initiate Authorization header"
        );
    }
}

#[tokio::test]
async fn test_chunked_upload_retries_exhausted() {
    let size = 2 * CHUNK;
    let (content, desc) = blob_of_size(size);

    let mut responders: Vec<Responder> = vec![expect(
        Method::Post,
        "/v2/test/repo/blobs/uploads/",
        response(202, &[("Location", "/one")], b""),
    )];
    for _ in 0..3 {
        responders.push(expect(
            Method::Patch,
            "/one",
            response(503, &[], b"still broken"),
        ));
    }
    let transport = ScriptedTransport::new(responders);
    let repo = test_repository(transport.clone())
        .with_upload_chunk_size(CHUNK)
        .with_retry_policy(fast_retries(2));

    let mut reader = Cursor::new(content);
    match repo.push_blob(&desc, &mut reader).await {
        Err(KitError::Network(message)) => {
            assert!(message.contains("retries"), "got: {}", message);
        }
        other => panic!("expected network error after retries, got {:?}", other),
    }
    // Initial attempt plus exactly two retries
    let patches = transport
        .recorded()
        .iter()
        .filter(|r| r.method == Method::Patch)
        .count();
    assert_eq!(patches, 3);
}

#[tokio::test]
async fn test_chunked_upload_range_desync_is_terminal() {
    let size = 2 * CHUNK;
    let (content, desc) = blob_of_size(size);

    let responders: Vec<Responder> = vec![
        expect(
            Method::Post,
            "/v2/test/repo/blobs/uploads/",
            response(202, &[("Location", "/one")], b""),
        ),
        expect(
            Method::Patch,
            "/one",
            // Confirms less than what was sent
            response(202, &[("Location", "/two"), ("Range", "0-524287")], b""),
        ),
    ];
    let transport = ScriptedTransport::new(responders);
    let repo = test_repository(transport).with_upload_chunk_size(CHUNK);

    let mut reader = Cursor::new(content);
    match repo.push_blob(&desc, &mut reader).await {
        Err(KitError::Integrity(message)) => {
            assert!(message.contains("mismatch in range header"), "got: {}", message);
        }
        other => panic!("expected integrity error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_small_blob_uploads_monolithically() {
    let (content, desc) = blob_of_size(100);

    let responders: Vec<Responder> = vec![
        expect(
            Method::Post,
            "/v2/test/repo/blobs/uploads/",
            response(202, &[("Location", "/session")], b""),
        ),
        Box::new(|request: &HttpRequest| {
            if request.method != Method::Put {
                return Err(KitError::Network("expected PUT".to_string()));
            }
            if !request.url.query().unwrap_or("").contains("digest=") {
                return Err(KitError::Network("missing digest query".to_string()));
            }
            if request.body.as_ref().map(|b| b.len()) != Some(100) {
                return Err(KitError::Network("expected full body".to_string()));
            }
            Ok(response(201, &[("Location", "/blob")], b""))
        }),
    ];
    let transport = ScriptedTransport::new(responders);
    let repo = test_repository(transport.clone()).with_upload_chunk_size(CHUNK);

    let mut reader = Cursor::new(content);
    let location = repo.push_blob(&desc, &mut reader).await.unwrap();
    assert_eq!(location, "/blob");
    assert_eq!(transport.recorded().len(), 2, "no PATCH requests");
}

#[tokio::test]
async fn test_remove_remote_tag_untags_once() {
    let manifest_body = br#"{"schemaVersion":2}"#;
    let responders: Vec<Responder> = vec![
        expect(
            Method::Get,
            "/v2/test/repo/manifests/v1",
            response(200, &[], manifest_body),
        ),
        expect(
            Method::Delete,
            "/v2/test/repo/manifests/v1",
            response(202, &[], b""),
        ),
    ];
    let transport = ScriptedTransport::new(responders);
    let repo = test_repository(transport.clone());
    let reference = Reference::parse("registry.example/test/repo:v1").unwrap();

    ops::remove_remote(&repo, &reference, false).await.unwrap();

    let requests = transport.recorded();
    let deletes: Vec<&HttpRequest> = requests
        .iter()
        .filter(|r| r.method == Method::Delete)
        .collect();
    assert_eq!(deletes.len(), 1);
    assert!(deletes[0].url.path().ends_with("/manifests/v1"));
}

#[tokio::test]
async fn test_remove_remote_digest_deletes_manifest() {
    let manifest_body = br#"{"schemaVersion":2}"#;
    let manifest_digest = digest::sha256_digest(manifest_body);

    let reference_str = format!("registry.example/test/repo@{}", manifest_digest);
    let reference = Reference::parse(&reference_str).unwrap();

    let get_path: &'static str = Box::leak(
        format!("/v2/test/repo/manifests/{}", manifest_digest).into_boxed_str(),
    );
    let responders: Vec<Responder> = vec![
        expect(Method::Get, get_path, response(200, &[], manifest_body)),
        expect(Method::Delete, get_path, response(202, &[], b"")),
    ];
    let transport = ScriptedTransport::new(responders);
    let repo = Repository::new(
        transport.clone(),
        Arc::new(NoCredentials),
        reference.clone(),
        &plain_http_opts(),
    );

    ops::remove_remote(&repo, &reference, false).await.unwrap();

    let requests = transport.recorded();
    let deletes: Vec<&HttpRequest> = requests
        .iter()
        .filter(|r| r.method == Method::Delete)
        .collect();
    assert_eq!(deletes.len(), 1);
    assert!(deletes[0].url.path().contains(&manifest_digest));
}

#[tokio::test]
async fn test_remove_remote_force_deletes_by_digest() {
    let manifest_body = br#"{"schemaVersion":2}"#;
    let manifest_digest = digest::sha256_digest(manifest_body);
    let delete_path: &'static str = Box::leak(
        format!("/v2/test/repo/manifests/{}", manifest_digest).into_boxed_str(),
    );

    let responders: Vec<Responder> = vec![
        Box::new({
            let body = manifest_body.to_vec();
            let digest_header = manifest_digest.clone();
            move |_request: &HttpRequest| {
                Ok(response(
                    200,
                    &[("Docker-Content-Digest", digest_header.as_str())],
                    &body,
                ))
            }
        }),
        expect(Method::Delete, delete_path, response(202, &[], b"")),
    ];
    let transport = ScriptedTransport::new(responders);
    let repo = test_repository(transport.clone());
    let reference = Reference::parse("registry.example/test/repo:v1").unwrap();

    ops::remove_remote(&repo, &reference, true).await.unwrap();

    let deletes = transport
        .recorded()
        .iter()
        .filter(|r| r.method == Method::Delete)
        .count();
    assert_eq!(deletes, 1);
}

#[tokio::test]
async fn test_remove_remote_unsupported_registry() {
    let manifest_body = br#"{"schemaVersion":2}"#;
    let responders: Vec<Responder> = vec![
        expect(
            Method::Get,
            "/v2/test/repo/manifests/v1",
            response(200, &[], manifest_body),
        ),
        expect(
            Method::Delete,
            "/v2/test/repo/manifests/v1",
            response(405, &[], b""),
        ),
    ];
    let transport = ScriptedTransport::new(responders);
    let repo = test_repository(transport);
    let reference = Reference::parse("registry.example/test/repo:v1").unwrap();

    match ops::remove_remote(&repo, &reference, false).await {
        Err(KitError::Unsupported(message)) => {
            assert!(
                message.contains("does not support untagging"),
                "got: {}",
                message
            );
        }
        other => panic!("expected unsupported error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_resolve_not_found() {
    let responders: Vec<Responder> = vec![expect(
        Method::Get,
        "/v2/test/repo/manifests/missing",
        response(404, &[], b""),
    )];
    let transport = ScriptedTransport::new(responders);
    let repo = test_repository(transport);
    match repo.resolve("missing").await {
        Err(KitError::NotFound(_)) => {}
        other => panic!("expected not found, got {:?}", other),
    }
}

#[tokio::test]
async fn test_fetch_blob_verifies_digest() {
    let (content, desc) = blob_of_size(64);

    // Server returns corrupted content of the right length
    let mut corrupted = content.clone();
    corrupted[0] ^= 0xff;
    let responders: Vec<Responder> = vec![Box::new(move |_request: &HttpRequest| {
        Ok(response(200, &[], &corrupted))
    })];
    let transport = ScriptedTransport::new(responders);
    let repo = test_repository(transport);

    match repo.fetch_blob(&desc).await {
        Err(KitError::Integrity(_)) => {}
        other => panic!("expected integrity error, got {:?}", other),
    }
}
