//! Remote registry support: OCI Distribution v2 over a pluggable transport.

pub mod auth;
pub mod credentials;
pub mod repository;
pub mod retry;
pub mod transport;

pub use credentials::{Credential, CredentialSource, FileCredentialStore, NoCredentials};
pub use repository::{Repository, DEFAULT_UPLOAD_CHUNK_SIZE};
pub use retry::RetryPolicy;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};
