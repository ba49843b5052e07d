//! Storegate gateway.
//!
//! One logical interface over many storage sources: source and credential
//! management, a rate and retry governor in front of every provider call,
//! signed pagination cursors, and resumable multipart transfers.

pub mod buckets;
pub mod config;
pub mod context;
pub mod credentials;
pub mod cursor;
pub mod gateway;
pub mod governor;
pub mod persist;
pub mod sources;
pub mod transfer;

pub use buckets::SqliteBucketStore;
pub use config::{
    CursorSettings, GatewayConfig, RateLimitSettings, RetrySettings, TimeoutConfig,
    TransferSettings,
};
pub use context::RequestContext;
pub use credentials::{
    CredentialBroker, CredentialRefresher, CredentialStore, FileCredentialStore,
    MemoryCredentialStore, OAuthRefresher, OAuthSettings, ScopedCredentials,
};
pub use cursor::{list_signature, CursorManager};
pub use gateway::{
    FederatedListing, FederatedRequest, GatewayBuilder, ListingPage, SourceFailure,
    StorageGateway, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
pub use governor::{
    BucketStore, Governor, MemoryBucketStore, MemoryRateLimiter, RateLimitBackend, RetryConfig,
    SharedRateLimiter,
};
pub use sources::{FileSourceStore, MemorySourceStore, NewSource, SourceStore, StorageSource};
pub use transfer::{
    CollectReport, Direction, DownloadedPart, FileSessionStore, MemorySessionStore, PartAck,
    SessionStore, TransferCoordinator, TransferSession, TransferState, TransferStatus,
    TransferTicket,
};
