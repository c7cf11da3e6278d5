//! KitForge Engine - ModelKit packaging and distribution.
//!
//! This crate implements the artifact engine: Kitfile parsing and
//! resolution, the media-type grammar, a local content-addressed store
//! (OCI Image Layout), the packer and unpacker, and an OCI Distribution v2
//! registry client.
//!
//! # Architecture
//!
//! ```text
//! Kitfile ──► packer ──► tar+gzip layers ──► local store ──► registry
//!                                              │
//! unpack dir ◄── unpacker ◄────────────────────┘
//! ```

pub mod digest;
pub mod filter;
pub mod ignore;
pub mod kitfile;
pub mod mediatype;
pub mod oci;
pub mod ops;
pub mod pack;
pub mod paths;
pub mod reference;
pub mod remote;
pub mod store;
pub mod unpack;

// Re-export common types
pub use filter::{parse_filter, FilterConf, FilterType};
pub use kitfile::Kitfile;
pub use mediatype::{parse_media_type, BaseType, CompressionType, MediaType};
pub use oci::{Descriptor, Manifest};
pub use pack::PackOptions;
pub use reference::Reference;
pub use remote::{Repository, ReqwestTransport};
pub use store::{LocalStore, ManifestInfo};
pub use unpack::UnpackOptions;

/// KitForge engine version, recorded in packed manifests.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
