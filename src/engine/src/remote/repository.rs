//! OCI Distribution v2 repository client.
//!
//! Implements manifest resolution, blob fetch, and the blob push state
//! machine: an upload session is initiated with a POST, the content goes up
//! either monolithically or in sequential PATCH chunks, and a final
//! digest-query PUT seals the blob. The `Authorization` header obtained when
//! initiating the session is replayed on every subsequent request of that
//! session.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use kitforge_core::{config::NetworkOptions, KitError, Result};
use url::Url;

use super::auth::AuthClient;
use super::credentials::CredentialSource;
use super::retry::{Attempt, RetryPolicy};
use super::transport::{HttpRequest, HttpResponse, HttpTransport, Method};
use crate::digest;
use crate::oci::{Descriptor, OCI_INDEX_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE};
use crate::reference::Reference;

/// Default chunk size for chunked blob uploads (100 MiB).
pub const DEFAULT_UPLOAD_CHUNK_SIZE: i64 = 100 * 1024 * 1024;

/// Registries whose upload endpoints only accept monolithic puts.
const MONOLITHIC_UPLOAD_HOSTS: &[&str] = &["docker.io", "registry-1.docker.io", "index.docker.io"];

const ACCEPT_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const AUTHORIZATION: &str = "Authorization";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadFormat {
    Monolithic,
    Chunked,
}

/// A client for one remote repository.
pub struct Repository {
    client: AuthClient,
    transport: Arc<dyn HttpTransport>,
    reference: Reference,
    plain_http: bool,
    upload_chunk_size: i64,
    retry_policy: RetryPolicy,
    explicit_port_443: bool,
}

impl Repository {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        credentials: Arc<dyn CredentialSource>,
        reference: Reference,
        opts: &NetworkOptions,
    ) -> Self {
        let explicit_port_443 = reference.registry.ends_with(":443");
        Self {
            client: AuthClient::new(transport.clone(), credentials),
            transport,
            reference,
            plain_http: opts.plain_http,
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            retry_policy: RetryPolicy::default(),
            explicit_port_443,
        }
    }

    /// Override the chunk size used for chunked uploads.
    pub fn with_upload_chunk_size(mut self, chunk_size: i64) -> Self {
        self.upload_chunk_size = chunk_size.max(1);
        self
    }

    /// Override the retry policy for chunk uploads.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// The reference this client addresses.
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    fn scheme(&self) -> &'static str {
        if self.plain_http {
            "http"
        } else {
            "https"
        }
    }

    fn manifests_url(&self, manifest_ref: &str) -> Result<Url> {
        parse_url(&format!(
            "{}://{}/v2/{}/manifests/{}",
            self.scheme(),
            self.reference.registry,
            self.reference.repository,
            manifest_ref
        ))
    }

    fn blobs_url(&self, blob_digest: &str) -> Result<Url> {
        parse_url(&format!(
            "{}://{}/v2/{}/blobs/{}",
            self.scheme(),
            self.reference.registry,
            self.reference.repository,
            blob_digest
        ))
    }

    fn uploads_url(&self) -> Result<Url> {
        parse_url(&format!(
            "{}://{}/v2/{}/blobs/uploads/",
            self.scheme(),
            self.reference.registry,
            self.reference.repository
        ))
    }

    /// Resolve a tag or digest to a manifest descriptor.
    pub async fn resolve(&self, manifest_ref: &str) -> Result<Descriptor> {
        let url = self.manifests_url(manifest_ref)?;
        let request = HttpRequest::new(Method::Get, url).header(
            "Accept",
            format!("{}, {}", ACCEPT_MANIFEST, OCI_INDEX_MEDIA_TYPE),
        );
        let response = self.client.send(request).await?;
        match response.status {
            200 => {}
            404 => {
                return Err(KitError::NotFound(format!(
                    "reference {} in remote registry",
                    manifest_ref
                )))
            }
            _ => return Err(remote_error(&response)),
        }

        let manifest_digest = match response.header("docker-content-digest") {
            Some(header_digest) => header_digest.to_string(),
            None => digest::sha256_digest(&response.body),
        };
        let media_type = response
            .header("content-type")
            .unwrap_or(OCI_MANIFEST_MEDIA_TYPE)
            .to_string();
        Ok(Descriptor::new(
            media_type,
            manifest_digest,
            response.body.len() as i64,
        ))
    }

    /// Fetch manifest bytes for a descriptor, verifying the digest.
    pub async fn fetch_manifest_bytes(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        let url = self.manifests_url(&desc.digest)?;
        let request = HttpRequest::new(Method::Get, url).header("Accept", ACCEPT_MANIFEST);
        let response = self.client.send(request).await?;
        if response.status == 404 {
            return Err(KitError::NotFound(format!("manifest {}", desc.digest)));
        }
        if !response.is_success() {
            return Err(remote_error(&response));
        }
        let actual = digest::sha256_digest(&response.body);
        if actual != desc.digest {
            return Err(KitError::Integrity(format!(
                "manifest digest mismatch: expected {}, got {}",
                desc.digest, actual
            )));
        }
        Ok(response.body)
    }

    /// Fetch a blob, verifying digest and size.
    pub async fn fetch_blob(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        let url = self.blobs_url(&desc.digest)?;
        let response = self
            .client
            .send(HttpRequest::new(Method::Get, url))
            .await?;
        if response.status == 404 {
            return Err(KitError::NotFound(format!("blob {}", desc.digest)));
        }
        if !response.is_success() {
            return Err(remote_error(&response));
        }
        if response.body.len() as i64 != desc.size {
            return Err(KitError::Integrity(format!(
                "blob size mismatch for {}: expected {}, got {}",
                desc.digest,
                desc.size,
                response.body.len()
            )));
        }
        let actual = digest::sha256_digest(&response.body);
        if actual != desc.digest {
            return Err(KitError::Integrity(format!(
                "blob digest mismatch: expected {}, got {}",
                desc.digest, actual
            )));
        }
        Ok(response.body)
    }

    /// Whether the registry already has a blob.
    pub async fn blob_exists(&self, blob_digest: &str) -> Result<bool> {
        let url = self.blobs_url(blob_digest)?;
        let response = self
            .client
            .send(HttpRequest::new(Method::Head, url))
            .await?;
        match response.status {
            200 => Ok(true),
            404 => Ok(false),
            _ => Err(remote_error(&response)),
        }
    }

    /// Push a manifest under a tag or digest.
    pub async fn push_manifest(&self, manifest_ref: &str, manifest_bytes: &[u8]) -> Result<()> {
        let url = self.manifests_url(manifest_ref)?;
        let request = HttpRequest::new(Method::Put, url)
            .header("Content-Type", OCI_MANIFEST_MEDIA_TYPE)
            .body(manifest_bytes.to_vec());
        let response = self.client.send(request).await?;
        if response.status != 201 {
            return Err(remote_error(&response));
        }
        tracing::debug!(reference = %manifest_ref, "Pushed manifest");
        Ok(())
    }

    /// Push a blob, choosing monolithic or chunked upload. Returns the blob
    /// location reported by the registry.
    pub async fn push_blob<R>(&self, expected: &Descriptor, content: &mut R) -> Result<String>
    where
        R: Read + Seek + Send,
    {
        let (session_location, auth_header) = self.initiate_upload().await?;
        tracing::debug!(
            digest = %expected.digest,
            size = expected.size,
            "Initiated blob upload session"
        );

        let host = self.reference.registry.clone();
        let format = upload_format(&host, expected.size, self.upload_chunk_size);
        match format {
            UploadFormat::Monolithic => {
                self.upload_blob_monolithic(&session_location, auth_header.as_deref(), expected, content)
                    .await
            }
            UploadFormat::Chunked => {
                self.upload_blob_chunked(&session_location, auth_header.as_deref(), expected, content)
                    .await
            }
        }
    }

    /// `POST /v2/<repo>/blobs/uploads/`: expect 202 plus a session Location.
    async fn initiate_upload(&self) -> Result<(String, Option<String>)> {
        let url = self.uploads_url()?;
        let (response, auth_header) = self
            .client
            .send_with_auth(HttpRequest::new(Method::Post, url.clone()))
            .await?;
        if response.status != 202 {
            return Err(remote_error(&response));
        }
        let location = response.header("location").ok_or_else(|| {
            KitError::Network("registry did not respond with upload location".to_string())
        })?;
        Ok((self.resolve_location(&url, location)?, auth_header))
    }

    /// Upload the whole blob in one digest-query PUT.
    async fn upload_blob_monolithic<R>(
        &self,
        location: &str,
        auth_header: Option<&str>,
        expected: &Descriptor,
        content: &mut R,
    ) -> Result<String>
    where
        R: Read + Seek + Send,
    {
        let body = read_range(content, 0, expected.size)?;
        let url = location_with_digest(location, &expected.digest)?;
        let mut request = HttpRequest::new(Method::Put, url)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Length", expected.size.to_string())
            .body(body);
        if let Some(header) = auth_header {
            request = request.header(AUTHORIZATION, header);
        }

        tracing::debug!(digest = %expected.digest, "Uploading blob as one chunk");
        let response = self.transport.execute(request).await?;
        if response.status != 201 {
            return Err(remote_error(&response));
        }
        Ok(response.header("location").unwrap_or_default().to_string())
    }

    /// Upload the blob in sequential PATCH chunks, then finalize with an
    /// empty digest-query PUT.
    async fn upload_blob_chunked<R>(
        &self,
        location: &str,
        auth_header: Option<&str>,
        expected: &Descriptor,
        content: &mut R,
    ) -> Result<String>
    where
        R: Read + Seek + Send,
    {
        let chunk_size = self.upload_chunk_size;
        let num_chunks = (expected.size + chunk_size - 1) / chunk_size;

        let mut range_start: i64 = 0;
        let mut range_end: i64 = (chunk_size - 1).min(expected.size - 1);
        let mut next_location = location.to_string();

        for chunk_index in 0..num_chunks {
            tracing::debug!(
                digest = %expected.digest,
                chunk = chunk_index + 1,
                total = num_chunks,
                range = %format!("{}-{}", range_start, range_end),
                "Uploading chunk"
            );
            let url = parse_url(&next_location)?;
            let response = self
                .upload_chunk_with_retry(&url, auth_header, content, range_start, range_end)
                .await?;

            let location_header = response.header("location").ok_or_else(|| {
                KitError::Network("missing Location header in response".to_string())
            })?;
            let resolved = self.resolve_location(&url, location_header)?;

            // The registry's Range must confirm everything sent so far
            let response_range = response
                .header("range")
                .ok_or_else(|| KitError::Network("missing Range header in response".to_string()))?;
            let confirmed_end = parse_range_end(response_range)?;
            if confirmed_end != range_end {
                return Err(KitError::Integrity(format!(
                    "mismatch in range header: expected 0-{}, actual 0-{}",
                    range_end, confirmed_end
                )));
            }

            next_location = resolved;
            range_start = range_end + 1;
            range_end = (expected.size - 1).min(range_end + chunk_size);
        }

        // Final PUT marks the upload complete; the last chunk could ride
        // along here but is sent separately for simplicity.
        tracing::debug!(digest = %expected.digest, "Finalizing upload");
        let url = location_with_digest(&next_location, &expected.digest)?;
        let mut request = HttpRequest::new(Method::Put, url);
        if let Some(header) = auth_header {
            request = request.header(AUTHORIZATION, header);
        }
        let response = self.transport.execute(request).await?;
        if response.status != 201 {
            return Err(remote_error(&response));
        }
        Ok(response.header("location").unwrap_or_default().to_string())
    }

    /// Send one chunk PATCH, retrying transient failures. The content
    /// reader is seeked back to the chunk start before every attempt.
    async fn upload_chunk_with_retry<R>(
        &self,
        url: &Url,
        auth_header: Option<&str>,
        content: &mut R,
        range_start: i64,
        range_end: i64,
    ) -> Result<HttpResponse>
    where
        R: Read + Seek + Send,
    {
        let mut attempt: u32 = 0;
        loop {
            let body = read_range(content, range_start, range_end - range_start + 1)?;
            let mut request = HttpRequest::new(Method::Patch, url.clone())
                .header("Content-Range", format!("{}-{}", range_start, range_end))
                .header("Content-Type", "application/octet-stream")
                .body(body);
            if let Some(header) = auth_header {
                request = request.header(AUTHORIZATION, header);
            }

            let delay = match self.transport.execute(request).await {
                Ok(response) if response.status == 202 => return Ok(response),
                Ok(response) => {
                    match self
                        .retry_policy
                        .next_delay(attempt, Attempt::Status(response.status))
                    {
                        Some(delay) => delay,
                        None if RetryPolicy::retryable_status(response.status) => {
                            return Err(KitError::Network(format!(
                                "chunk upload failed after {} retries: HTTP {}: {}",
                                attempt,
                                response.status,
                                response.body_text()
                            )));
                        }
                        None => return Err(remote_error(&response)),
                    }
                }
                Err(err) => match self.retry_policy.next_delay(attempt, Attempt::Error(&err)) {
                    Some(delay) => delay,
                    None if err.is_retryable() => {
                        return Err(KitError::Network(format!(
                            "chunk upload failed after {} retries: {}",
                            attempt, err
                        )));
                    }
                    None => return Err(err),
                },
            };

            tracing::debug!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Chunk upload failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Delete a manifest by digest; the registry drops every tag pointing
    /// at it.
    pub async fn delete_manifest(&self, desc: &Descriptor) -> Result<()> {
        let url = self.manifests_url(&desc.digest)?;
        let response = self
            .client
            .send(HttpRequest::new(Method::Delete, url))
            .await?;
        match response.status {
            200 | 202 => Ok(()),
            404 => Err(KitError::NotFound(format!(
                "manifest {} in remote registry",
                desc.digest
            ))),
            405 => Err(KitError::Unsupported(format!(
                "removing models is unsupported by registry {}",
                self.reference.registry
            ))),
            _ => Err(remote_error(&response)),
        }
    }

    /// Delete only a tag, leaving the manifest for the registry to prune.
    pub async fn untag(&self, tag: &str) -> Result<()> {
        if digest::is_valid_digest(tag) {
            return Err(KitError::InvalidReference {
                reference: tag.to_string(),
                message: "cannot untag using digest".to_string(),
            });
        }
        let url = self.manifests_url(tag)?;
        let response = self
            .client
            .send(HttpRequest::new(Method::Delete, url))
            .await?;
        match response.status {
            202 => Ok(()),
            400 | 405 => Err(KitError::Unsupported(
                "remote registry does not support untagging".to_string(),
            )),
            404 => Err(KitError::NotFound(format!(
                "reference {} in remote registry",
                tag
            ))),
            _ => Err(remote_error(&response)),
        }
    }

    /// Resolve a Location header against the request URL. When the origin
    /// carried an explicit `:443` and the registry's Location drops it, the
    /// port is reattached so the session's authority strings stay aligned.
    fn resolve_location(&self, base: &Url, location: &str) -> Result<String> {
        let joined = base
            .join(location)
            .map_err(|e| KitError::Network(format!("invalid Location '{}': {}", location, e)))?;
        let mut resolved = joined.to_string();
        if self.explicit_port_443
            && joined.scheme() == "https"
            && joined.port().is_none()
            && joined.host_str() == base.host_str()
        {
            if let Some(host) = joined.host_str() {
                resolved = resolved.replacen(
                    &format!("://{}/", host),
                    &format!("://{}:443/", host),
                    1,
                );
            }
        }
        Ok(resolved)
    }
}

fn upload_format(host: &str, blob_size: i64, chunk_size: i64) -> UploadFormat {
    let bare_host = host.split(':').next().unwrap_or(host);
    if MONOLITHIC_UPLOAD_HOSTS.contains(&bare_host) || blob_size <= chunk_size {
        UploadFormat::Monolithic
    } else {
        UploadFormat::Chunked
    }
}

fn parse_url(s: &str) -> Result<Url> {
    Url::parse(s).map_err(|e| KitError::Network(format!("invalid URL '{}': {}", s, e)))
}

fn location_with_digest(location: &str, blob_digest: &str) -> Result<Url> {
    let mut url = parse_url(location)?;
    url.query_pairs_mut().append_pair("digest", blob_digest);
    Ok(url)
}

/// Seek to `start` and read exactly `len` bytes.
fn read_range<R: Read + Seek>(content: &mut R, start: i64, len: i64) -> Result<Vec<u8>> {
    content
        .seek(SeekFrom::Start(start as u64))
        .map_err(|e| KitError::Network(format!("cannot seek content for upload: {}", e)))?;
    let mut buf = Vec::with_capacity(len as usize);
    content.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() as i64 != len {
        return Err(KitError::Integrity(format!(
            "content shorter than expected: wanted {} bytes at offset {}, got {}",
            len,
            start,
            buf.len()
        )));
    }
    Ok(buf)
}

/// Parse the end offset out of a `Range: 0-<end>` header.
fn parse_range_end(range: &str) -> Result<i64> {
    let invalid = || KitError::Network(format!("server returned invalid Range header: {}", range));
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    if start != "0" {
        return Err(invalid());
    }
    end.parse::<i64>().map_err(|_| invalid())
}

fn remote_error(response: &HttpResponse) -> KitError {
    KitError::Server {
        status: response.status,
        message: response.body_text(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_format_selection() {
        assert_eq!(
            upload_format("ghcr.io", 10, 100),
            UploadFormat::Monolithic,
            "small blobs upload monolithically"
        );
        assert_eq!(
            upload_format("ghcr.io", 1000, 100),
            UploadFormat::Chunked,
            "large blobs upload chunked"
        );
        assert_eq!(
            upload_format("registry-1.docker.io", 1000, 100),
            UploadFormat::Monolithic,
            "monolithic-only hosts never chunk"
        );
        assert_eq!(
            upload_format("docker.io:443", 1000, 100),
            UploadFormat::Monolithic,
            "port does not defeat the host check"
        );
    }

    #[test]
    fn test_parse_range_end() {
        assert_eq!(parse_range_end("0-1048575").unwrap(), 1048575);
        assert!(parse_range_end("1-2").is_err());
        assert!(parse_range_end("0-").is_err());
        assert!(parse_range_end("garbage").is_err());
    }

    #[test]
    fn test_read_range() {
        let data: Vec<u8> = (0..100).collect();
        let mut cursor = std::io::Cursor::new(data.clone());
        assert_eq!(read_range(&mut cursor, 0, 10).unwrap(), &data[0..10]);
        assert_eq!(read_range(&mut cursor, 90, 10).unwrap(), &data[90..100]);
        // Re-reading the same range after a seek works (retry path)
        assert_eq!(read_range(&mut cursor, 90, 10).unwrap(), &data[90..100]);
        assert!(read_range(&mut cursor, 95, 10).is_err());
    }

    #[test]
    fn test_location_with_digest() {
        let url = location_with_digest("https://reg.example/upload/session1", "sha256:abc").unwrap();
        assert!(url.query().unwrap().contains("digest="));
        let with_query =
            location_with_digest("https://reg.example/upload?state=xyz", "sha256:abc").unwrap();
        assert!(with_query.query().unwrap().starts_with("state=xyz&"));
    }
}
