//! azblob-rs: the core of an Azure Blob Storage client, built directly on
//! the REST protocol.
//!
//! The crate provides chunked uploads and downloads with bounded parallelism
//! and per-request retry, blob and container leases, lazy paged listings
//! (flat and hierarchical), metadata/tag/property management with ETag
//! concurrency, and a blob index tag-query language. The raw HTTP exchange
//! and credential acquisition are consumed through the [`Transport`] and
//! [`TokenCredential`] traits.
//!
//! [`MemoryBlobService`] implements [`Transport`] over an in-memory store and
//! speaks the same wire protocol, so every engine can run without a network.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use azblob_rs::{BlobServiceClient, DownloadOptions, MemoryBlobService, UploadOptions};
//!
//! # async fn demo() -> azblob_rs::BlobResult<()> {
//! let service = BlobServiceClient::new(Arc::new(MemoryBlobService::new()));
//! let container = service.container_client("photos");
//! container.create_if_not_exists().await?;
//!
//! let blob = container.blob_client("2024/cat.png");
//! blob.upload("meow".into(), &UploadOptions::default()).await?;
//! let bytes = blob.download_bytes(&DownloadOptions::default()).await?;
//! assert_eq!(&bytes[..], b"meow");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod emulator;
pub mod error;
pub mod lease;
pub mod listing;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod retry;
pub mod transfer;
pub mod transport;
pub mod xml;

// Re-exports for convenience
pub use client::{
    AccessConditions, BlobClient, BlobServiceClient, ContainerClient, ListBlobsOptions,
    ListContainersOptions,
};
pub use config::{CancelPolicy, ClientConfig, RetryOptions, TransferOptions, DEFAULT_ACCOUNT};
pub use emulator::{MemoryBlobService, MemoryMetadataStore, MetadataStore};
pub use error::{BlobError, BlobResult, ErrorCode, StorageError, StorageResult};
pub use lease::{Lease, LeaseClient, LeasePeriod};
pub use listing::{PageSource, Pager};
pub use logging::init_tracing;
pub use query::TagQuery;
pub use transfer::{ChunkStream, DownloadOptions, UploadOptions};
pub use transport::{
    AccessToken, StaticTokenCredential, TokenCredential, Transport, TransportError,
    TransportRequest, TransportResponse,
};
