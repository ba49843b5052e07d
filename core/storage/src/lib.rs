//! Storage adapter abstraction for Storegate.
//!
//! This module provides a trait-based interface over cloud storage backends
//! (S3-compatible stores, OneDrive, Google Drive, and an in-memory fake) and
//! an adapter registry for resolving a provider kind to an adapter.
//!
//! # Design Principles
//! - Provider isolation: no provider-specific logic above this crate
//! - Async operations: all I/O operations are async
//! - Streaming support: reads are handed out as byte streams
//! - Unified error semantics: every provider failure is classified into the common taxonomy

pub mod gdrive;
pub mod http;
pub mod memory;
pub mod oauth;
pub mod onedrive;
pub mod provider;
pub mod registry;
pub mod s3;

pub use memory::{Fault, MemoryAdapter, Operation};
pub use oauth::{OAuthAppConfig, OAuthClient, OAuthEndpoints};
pub use provider::{
    collect_stream, stream_from_bytes, ByteStream, CredentialSource, ListPage, MultipartUpload,
    PartLimits, PartReceipt, PartUpload, RateLimitSignal, RateQuota, ShareLink,
    StaticCredentials, StorageAdapter, WriteOptions,
};
pub use registry::{create_default_registry, AdapterConfig, AdapterFactory, AdapterRegistry};
