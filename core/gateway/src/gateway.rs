//! The storage gateway facade.
//!
//! Resolves a source reference to a cached adapter, runs the call through the
//! governor under the caller's timeout and cancellation, and normalizes the
//! result: entries tagged with their source, continuation tokens wrapped in
//! cursors.

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::future::join_all;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use storegate_common::{
    ByteRange, Credential, Error, ErrorKind, FileEntry, LogicalPath, Result, SourceId,
};
use storegate_storage::{
    collect_stream, create_default_registry, AdapterRegistry, ByteStream, RateQuota, ShareLink,
    StorageAdapter, WriteOptions,
};

use crate::config::GatewayConfig;
use crate::context::RequestContext;
use crate::credentials::{
    CredentialBroker, CredentialRefresher, CredentialStore, FileCredentialStore,
    MemoryCredentialStore, OAuthRefresher, ScopedCredentials,
};
use crate::cursor::{list_signature, CursorManager};
use crate::buckets::SqliteBucketStore;
use crate::governor::{Governor, MemoryRateLimiter, RateLimitBackend, SharedRateLimiter};
use crate::sources::{FileSourceStore, MemorySourceStore, NewSource, SourceStore, StorageSource};
use crate::transfer::{
    CollectReport, DownloadedPart, FileSessionStore, MemorySessionStore, PartAck, SessionStore,
    TransferCoordinator, TransferStatus, TransferTicket,
};

/// Page size used when the caller asks for zero.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Largest page any provider is asked for.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// One page of a folder listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingPage {
    pub entries: Vec<FileEntry>,
    pub next_cursor: Option<String>,
}

/// One source's part of a federated listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedRequest {
    pub source_id: SourceId,
    pub path: LogicalPath,
    #[serde(default)]
    pub cursor: Option<String>,
}

impl FederatedRequest {
    pub fn new(source_id: SourceId, path: LogicalPath) -> Self {
        Self {
            source_id,
            path,
            cursor: None,
        }
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }
}

/// A source that failed inside a federated listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source_id: SourceId,
    pub kind: ErrorKind,
    pub message: String,
}

/// Merged listing across sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FederatedListing {
    /// Entries of every healthy source, each tagged with its source id.
    pub entries: Vec<FileEntry>,
    /// Next cursor per source that has more entries.
    pub next_cursors: BTreeMap<SourceId, String>,
    pub failures: Vec<SourceFailure>,
}

/// Builder for [`StorageGateway`]. Anything not set falls back to an
/// in-memory store or a default derived from the config.
pub struct GatewayBuilder {
    config: GatewayConfig,
    registry: Option<AdapterRegistry>,
    sources: Option<Arc<dyn SourceStore>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    refresher: Option<Arc<dyn CredentialRefresher>>,
    sessions: Option<Arc<dyn SessionStore>>,
    limiter: Option<Arc<dyn RateLimitBackend>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            registry: None,
            sources: None,
            credentials: None,
            refresher: None,
            sessions: None,
            limiter: None,
        }
    }

    pub fn registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn source_store(mut self, store: Arc<dyn SourceStore>) -> Self {
        self.sources = Some(store);
        self
    }

    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(store);
        self
    }

    /// Bucket backend; a shared store is needed when several gateways serve
    /// the same sources.
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimitBackend>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// # Errors
    /// - `InvalidInput` if the config is invalid or the cursor key malformed
    /// - `Unavailable` if the shared bucket database cannot be opened
    pub fn build(self) -> Result<StorageGateway> {
        let config = self.config;
        config.validate()?;

        let sources = self
            .sources
            .unwrap_or_else(|| Arc::new(MemorySourceStore::new()));
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(MemoryCredentialStore::new()));
        let refresher = self
            .refresher
            .unwrap_or_else(|| Arc::new(OAuthRefresher::new(sources.clone())));
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));
        let limiter: Arc<dyn RateLimitBackend> =
            match (self.limiter, &config.rate_limit.shared_store) {
                (Some(limiter), _) => limiter,
                (None, Some(path)) => Arc::new(SharedRateLimiter::new(Arc::new(
                    SqliteBucketStore::open(path)?,
                ))),
                (None, None) => Arc::new(MemoryRateLimiter::new(
                    config.rate_limit.shards,
                    Duration::from_secs(config.rate_limit.idle_expiry_secs),
                )),
            };

        let cursor_ttl = Duration::from_secs(config.cursor.ttl_secs);
        let cursors = match &config.cursor.key_hex {
            Some(key) => CursorManager::from_hex_key(key, cursor_ttl)?,
            None => CursorManager::random(cursor_ttl),
        };

        let governor = Arc::new(Governor::new(
            config.retry.to_retry_config(),
            limiter,
            RateQuota {
                per_second: config.rate_limit.default_per_second,
                burst: config.rate_limit.default_burst,
            },
        ));
        let transfers = TransferCoordinator::new(
            sessions,
            governor.clone(),
            config.transfer.clone(),
            config.timeouts.transfer_part(),
        );

        Ok(StorageGateway {
            registry: self.registry.unwrap_or_else(create_default_registry),
            sources,
            broker: Arc::new(CredentialBroker::new(credentials, refresher)),
            governor,
            cursors,
            transfers,
            adapters: RwLock::new(HashMap::new()),
            config,
        })
    }
}

/// Uniform operations over every configured storage source.
pub struct StorageGateway {
    config: GatewayConfig,
    registry: AdapterRegistry,
    sources: Arc<dyn SourceStore>,
    broker: Arc<CredentialBroker>,
    governor: Arc<Governor>,
    cursors: CursorManager,
    transfers: TransferCoordinator,
    /// One adapter per source, built on first use.
    adapters: RwLock<HashMap<SourceId, Arc<dyn StorageAdapter>>>,
}

impl StorageGateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Gateway with file-backed stores under `data_dir`, with open transfer
    /// sessions recovered.
    pub async fn open(config: GatewayConfig, data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let gateway = Self::builder(config)
            .source_store(Arc::new(FileSourceStore::open(data_dir.join("sources.json")).await?))
            .credential_store(Arc::new(
                FileCredentialStore::open(data_dir.join("credentials.json")).await?,
            ))
            .session_store(Arc::new(
                FileSessionStore::open(data_dir.join("transfers.json")).await?,
            ))
            .build()?;
        gateway.recover_transfers().await?;
        Ok(gateway)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }

    pub fn credentials(&self) -> &Arc<CredentialBroker> {
        &self.broker
    }

    // ---- resolution ----

    /// Source owned by the caller. Another user's source is reported as missing.
    async fn owned_source(&self, ctx: &RequestContext, id: &SourceId) -> Result<StorageSource> {
        self.sources
            .get(id)
            .await?
            .filter(|source| source.owner == ctx.user_id)
            .ok_or_else(|| Error::NotFound(format!("Source not found: {}", id)))
    }

    async fn resolve(
        &self,
        ctx: &RequestContext,
        id: &SourceId,
    ) -> Result<(StorageSource, Arc<dyn StorageAdapter>)> {
        let source = self.owned_source(ctx, id).await?;
        if !source.enabled {
            return Err(Error::PermissionDenied(format!("Source {} is disabled", id)));
        }
        if !self.broker.has_credential(id).await? {
            return Err(Error::PermissionDenied(format!(
                "Source {} has no usable credential",
                id
            )));
        }
        let adapter = self.adapter_for(&source).await?;
        Ok((source, adapter))
    }

    async fn adapter_for(&self, source: &StorageSource) -> Result<Arc<dyn StorageAdapter>> {
        if let Some(adapter) = self.adapters.read().await.get(&source.id) {
            return Ok(adapter.clone());
        }

        let mut adapters = self.adapters.write().await;
        // Double-check after acquiring the write lock
        if let Some(adapter) = adapters.get(&source.id) {
            return Ok(adapter.clone());
        }

        let credentials = Arc::new(ScopedCredentials::new(self.broker.clone(), source.id.clone()));
        let adapter = self
            .registry
            .create(source.kind, &source.adapter_config(), credentials)?;
        debug!(source = %source.id, kind = %source.kind, "Adapter constructed");
        adapters.insert(source.id.clone(), adapter.clone());
        Ok(adapter)
    }

    async fn evict_adapter(&self, id: &SourceId) {
        if self.adapters.write().await.remove(id).is_some() {
            debug!(source = %id, "Adapter evicted");
        }
    }

    /// Run `fut` under the caller's cancellation token and a time limit.
    async fn bounded<T, Fut>(
        cancel: &CancellationToken,
        operation: &str,
        limit: Duration,
        fut: Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled(format!("{} cancelled", operation))),
            result = tokio::time::timeout(limit, fut) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!("{} exceeded {:?}", operation, limit))),
            },
        }
    }

    /// Apply the caller's timeout, or `default_limit`.
    async fn guarded<T, Fut>(
        &self,
        ctx: &RequestContext,
        operation: &str,
        default_limit: Duration,
        fut: Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let limit = ctx.timeout.unwrap_or(default_limit);
        let result = Self::bounded(&ctx.cancel, operation, limit, fut).await;
        if let Err(e) = &result {
            debug!(operation, kind = %e.kind(), "Gateway call failed: {}", e);
        }
        result
    }

    fn operation_timeout(&self) -> Duration {
        self.config.timeouts.operation()
    }

    // ---- listing ----

    async fn list_page(
        &self,
        source_id: &SourceId,
        adapter: &dyn StorageAdapter,
        path: &LogicalPath,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<ListingPage> {
        let signature = list_signature(path, None);
        let token = cursor
            .map(|c| self.cursors.resolve(c, source_id, &signature))
            .transpose()?;
        let page_size = match page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };

        let token = token.as_deref();
        let page = self
            .governor
            .execute(source_id, adapter, "list", move || {
                adapter.list(path, token, page_size)
            })
            .await?;

        let entries = page
            .entries
            .into_iter()
            .map(|entry| entry.with_source(source_id))
            .collect();
        let next_cursor = page
            .next_token
            .map(|token| self.cursors.issue(source_id, &signature, &token))
            .transpose()?;
        Ok(ListingPage {
            entries,
            next_cursor,
        })
    }

    /// List one page of a folder.
    ///
    /// # Errors
    /// - `InvalidCursor` if the cursor was issued for another source or
    ///   folder, was tampered with, or expired; restart the listing
    pub async fn list_folder(
        &self,
        ctx: &RequestContext,
        source_id: &SourceId,
        path: &LogicalPath,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<ListingPage> {
        self.guarded(ctx, "list_folder", self.operation_timeout(), async {
            let (source, adapter) = self.resolve(ctx, source_id).await?;
            self.list_page(&source.id, adapter.as_ref(), path, cursor, page_size)
                .await
        })
        .await
    }

    /// List several sources at once.
    ///
    /// Each source runs under its own timeout. A failing source is reported
    /// in `failures` and never fails the whole call.
    ///
    /// # Errors
    /// - `Cancelled` if the caller cancelled
    pub async fn federated_list(
        &self,
        ctx: &RequestContext,
        requests: &[FederatedRequest],
        page_size: u32,
    ) -> Result<FederatedListing> {
        let limit = ctx
            .timeout
            .unwrap_or_else(|| self.config.timeouts.federated_source());

        let listings = requests.iter().map(|request| async move {
            let result = Self::bounded(&ctx.cancel, "list_folder", limit, async {
                let (source, adapter) = self.resolve(ctx, &request.source_id).await?;
                self.list_page(
                    &source.id,
                    adapter.as_ref(),
                    &request.path,
                    request.cursor.as_deref(),
                    page_size,
                )
                .await
            })
            .await;
            (request, result)
        });
        let results = join_all(listings).await;

        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled("federated_list cancelled".to_string()));
        }

        let mut listing = FederatedListing::default();
        for (request, result) in results {
            match result {
                Ok(page) => {
                    listing.entries.extend(page.entries);
                    if let Some(cursor) = page.next_cursor {
                        listing.next_cursors.insert(request.source_id.clone(), cursor);
                    }
                }
                Err(e) => {
                    warn!(source = %request.source_id, kind = %e.kind(), "Federated listing failed: {}", e);
                    listing.failures.push(SourceFailure {
                        source_id: request.source_id.clone(),
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(listing)
    }

    // ---- entries ----

    pub async fn stat_entry(
        &self,
        ctx: &RequestContext,
        source_id: &SourceId,
        path: &LogicalPath,
    ) -> Result<FileEntry> {
        self.guarded(ctx, "stat_entry", self.operation_timeout(), async {
            let (source, adapter) = self.resolve(ctx, source_id).await?;
            let adapter = adapter.as_ref();
            let entry = self
                .governor
                .execute(&source.id, adapter, "stat", move || adapter.stat(path))
                .await?;
            Ok(entry.with_source(&source.id))
        })
        .await
    }

    /// Open a file for reading.
    ///
    /// The timeout covers opening the stream, not consuming it.
    pub async fn read_file(
        &self,
        ctx: &RequestContext,
        source_id: &SourceId,
        path: &LogicalPath,
        range: Option<ByteRange>,
    ) -> Result<ByteStream> {
        self.guarded(ctx, "read_file", self.operation_timeout(), async {
            let (source, adapter) = self.resolve(ctx, source_id).await?;
            let adapter = adapter.as_ref();
            self.governor
                .execute(&source.id, adapter, "read", move || adapter.read(path, range))
                .await
        })
        .await
    }

    /// Write a file from a stream.
    ///
    /// Payloads of known size within the provider's simple-upload limit go out
    /// in one request under the operation timeout. Larger or unsized payloads
    /// go through a transfer session, bounded per part instead.
    ///
    /// # Errors
    /// - `Conflict` if the file exists and `options` forbid overwriting, or
    ///   the etag does not match
    /// - `InvalidInput` if the stream length differs from `size`
    pub async fn write_file(
        &self,
        ctx: &RequestContext,
        source_id: &SourceId,
        path: &LogicalPath,
        stream: ByteStream,
        size: Option<u64>,
        options: &WriteOptions,
    ) -> Result<FileEntry> {
        let (source, adapter) = self
            .guarded(ctx, "write_file", self.operation_timeout(), self.resolve(ctx, source_id))
            .await?;
        let adapter = adapter.as_ref();

        match size {
            Some(size) if size <= adapter.part_limits().simple_upload_limit => {
                self.guarded(ctx, "write_file", self.operation_timeout(), async {
                    let data = collect_stream(stream).await?;
                    if data.len() as u64 != size {
                        return Err(Error::InvalidInput(format!(
                            "Stream held {} bytes, expected {}",
                            data.len(),
                            size
                        )));
                    }
                    let entry = self
                        .governor
                        .execute(&source.id, adapter, "write", move || {
                            adapter.write(path, data.clone(), options)
                        })
                        .await?;
                    Ok(entry.with_source(&source.id))
                })
                .await
            }
            _ => {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => Err(Error::Cancelled("write_file cancelled".to_string())),
                    result = self.write_in_parts(ctx, &source, adapter, path, stream, size, options) => result,
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_in_parts(
        &self,
        ctx: &RequestContext,
        source: &StorageSource,
        adapter: &dyn StorageAdapter,
        path: &LogicalPath,
        stream: ByteStream,
        size: Option<u64>,
        options: &WriteOptions,
    ) -> Result<FileEntry> {
        // Multipart completion replaces existing files, so check first.
        if !options.overwrite || options.if_match.is_some() {
            let existing = self
                .governor
                .execute(&source.id, adapter, "stat", move || adapter.stat(path))
                .await;
            match existing {
                Ok(_) if !options.overwrite => {
                    return Err(Error::Conflict(format!("{} already exists", path)));
                }
                Ok(entry) => {
                    if let Some(expected) = &options.if_match {
                        if entry.etag.as_deref() != Some(expected.as_str()) {
                            return Err(Error::Conflict(format!("{} has changed", path)));
                        }
                    }
                }
                Err(Error::NotFound(_)) if options.if_match.is_some() => {
                    return Err(Error::Conflict(format!("{} does not exist", path)));
                }
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let ticket = self
            .transfers
            .start_upload(adapter, &ctx.user_id, &source.id, path, size, None)
            .await?;
        debug!(session = %ticket.session_id, path = %path, "Writing through transfer session");

        match self.feed_parts(ctx, adapter, &ticket, stream).await {
            Ok(entry) => Ok(entry.with_source(&source.id)),
            Err(e) => {
                if let Err(abort_err) = self
                    .transfers
                    .abort(Some(adapter), &ctx.user_id, &ticket.session_id)
                    .await
                {
                    warn!(session = %ticket.session_id, "Failed to abort transfer: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    async fn feed_parts(
        &self,
        ctx: &RequestContext,
        adapter: &dyn StorageAdapter,
        ticket: &TransferTicket,
        mut stream: ByteStream,
    ) -> Result<FileEntry> {
        let part_size = usize::try_from(ticket.part_size)
            .map_err(|_| Error::InvalidInput("Part size too large".to_string()))?;
        let id = ticket.session_id.as_str();
        let mut buffer = BytesMut::new();
        let mut index = 0u32;

        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            // Keep at least one byte back so the final part is sent flagged.
            while buffer.len() > part_size {
                let part = buffer.split_to(part_size).freeze();
                self.transfers
                    .upload_part(adapter, &ctx.user_id, id, index, part, None, false)
                    .await?;
                index += 1;
            }
        }
        self.transfers
            .upload_part(adapter, &ctx.user_id, id, index, buffer.freeze(), None, true)
            .await?;
        self.transfers.complete_upload(adapter, &ctx.user_id, id).await
    }

    /// Delete a file or an empty folder.
    pub async fn delete_entry(
        &self,
        ctx: &RequestContext,
        source_id: &SourceId,
        path: &LogicalPath,
    ) -> Result<()> {
        self.guarded(ctx, "delete_entry", self.operation_timeout(), async {
            let (source, adapter) = self.resolve(ctx, source_id).await?;
            let adapter = adapter.as_ref();
            self.governor
                .execute(&source.id, adapter, "delete", move || adapter.delete(path))
                .await?;
            info!(source = %source.id, path = %path, "Entry deleted");
            Ok(())
        })
        .await
    }

    pub async fn move_entry(
        &self,
        ctx: &RequestContext,
        source_id: &SourceId,
        from: &LogicalPath,
        to: &LogicalPath,
        overwrite: bool,
    ) -> Result<FileEntry> {
        self.guarded(ctx, "move_entry", self.operation_timeout(), async {
            let (source, adapter) = self.resolve(ctx, source_id).await?;
            let adapter = adapter.as_ref();
            let entry = self
                .governor
                .execute(&source.id, adapter, "rename", move || {
                    adapter.rename(from, to, overwrite)
                })
                .await?;
            Ok(entry.with_source(&source.id))
        })
        .await
    }

    pub async fn create_folder(
        &self,
        ctx: &RequestContext,
        source_id: &SourceId,
        path: &LogicalPath,
    ) -> Result<FileEntry> {
        self.guarded(ctx, "create_folder", self.operation_timeout(), async {
            let (source, adapter) = self.resolve(ctx, source_id).await?;
            let adapter = adapter.as_ref();
            let entry = self
                .governor
                .execute(&source.id, adapter, "create_folder", move || {
                    adapter.create_folder(path)
                })
                .await?;
            Ok(entry.with_source(&source.id))
        })
        .await
    }

    /// Create a link granting read access to an entry.
    pub async fn share_link(
        &self,
        ctx: &RequestContext,
        source_id: &SourceId,
        path: &LogicalPath,
        expires_in: Duration,
    ) -> Result<ShareLink> {
        self.guarded(ctx, "share_link", self.operation_timeout(), async {
            let (source, adapter) = self.resolve(ctx, source_id).await?;
            let adapter = adapter.as_ref();
            self.governor
                .execute(&source.id, adapter, "share_link", move || {
                    adapter.share_link(path, expires_in)
                })
                .await
        })
        .await
    }

    // ---- source management ----

    /// Register a source for the caller together with its credential.
    ///
    /// # Errors
    /// - `Conflict` if the id is taken
    /// - `InvalidInput` if no adapter handles the kind or the settings are invalid
    pub async fn add_source(
        &self,
        ctx: &RequestContext,
        new_source: NewSource,
        credential: Credential,
    ) -> Result<StorageSource> {
        // Ids are global; the answer is the same whoever owns the taken id.
        if self.sources.get(&new_source.id).await?.is_some() {
            return Err(Error::Conflict(format!(
                "Source id {} is not available",
                new_source.id
            )));
        }
        if !self.registry.has_kind(new_source.kind) {
            return Err(Error::InvalidInput(format!(
                "No adapter for {} sources",
                new_source.kind
            )));
        }

        let source = new_source.into_source(ctx.user_id.clone());
        // Build the adapter now so invalid settings fail here.
        let credentials = Arc::new(ScopedCredentials::new(self.broker.clone(), source.id.clone()));
        let adapter = self
            .registry
            .create(source.kind, &source.adapter_config(), credentials)?;

        self.broker.store().put(&source.id, credential).await?;
        self.sources.put(source.clone()).await?;
        self.adapters
            .write()
            .await
            .insert(source.id.clone(), adapter);

        info!(source = %source.id, kind = %source.kind, owner = %source.owner, "Source added");
        Ok(source)
    }

    pub async fn list_sources(&self, ctx: &RequestContext) -> Result<Vec<StorageSource>> {
        self.sources.list_for(&ctx.user_id).await
    }

    pub async fn get_source(&self, ctx: &RequestContext, id: &SourceId) -> Result<StorageSource> {
        self.owned_source(ctx, id).await
    }

    pub async fn rename_source(
        &self,
        ctx: &RequestContext,
        id: &SourceId,
        display_name: impl Into<String>,
    ) -> Result<StorageSource> {
        let mut source = self.owned_source(ctx, id).await?;
        source.display_name = display_name.into();
        source.updated_at = Utc::now();
        self.sources.put(source.clone()).await?;
        Ok(source)
    }

    /// Enable or disable a source. A disabled source rejects every call.
    pub async fn set_source_enabled(
        &self,
        ctx: &RequestContext,
        id: &SourceId,
        enabled: bool,
    ) -> Result<StorageSource> {
        let mut source = self.owned_source(ctx, id).await?;
        source.enabled = enabled;
        source.updated_at = Utc::now();
        self.sources.put(source.clone()).await?;
        if !enabled {
            self.evict_adapter(id).await;
        }
        info!(source = %id, enabled, "Source state changed");
        Ok(source)
    }

    /// Replace a source's credential, e.g. after a new OAuth consent.
    pub async fn update_credential(
        &self,
        ctx: &RequestContext,
        id: &SourceId,
        credential: Credential,
    ) -> Result<()> {
        self.owned_source(ctx, id).await?;
        self.broker.store().put(id, credential).await?;
        self.evict_adapter(id).await;
        Ok(())
    }

    /// Delete a source's credential; the source behaves as disabled until a
    /// new one is stored.
    pub async fn revoke_credentials(&self, ctx: &RequestContext, id: &SourceId) -> Result<()> {
        self.owned_source(ctx, id).await?;
        self.broker.revoke(id).await?;
        self.evict_adapter(id).await;
        Ok(())
    }

    /// Remove a source, aborting its open transfers and dropping its
    /// credential and adapter.
    pub async fn remove_source(&self, ctx: &RequestContext, id: &SourceId) -> Result<()> {
        let source = self.owned_source(ctx, id).await?;

        let aborted = self.transfers.abort_for_source(id).await?;
        if aborted.iter().any(|s| s.upload.is_some()) {
            match self.adapter_for(&source).await {
                Ok(adapter) => {
                    for session in &aborted {
                        if let Some(upload) = &session.upload {
                            self.transfers
                                .release_upload(adapter.as_ref(), id, upload)
                                .await;
                        }
                    }
                }
                Err(e) => warn!(source = %id, "Cannot release provider uploads: {}", e),
            }
        }

        self.evict_adapter(id).await;
        self.broker.revoke(id).await?;
        self.sources.remove(id).await?;
        info!(source = %id, transfers = aborted.len(), "Source removed");
        Ok(())
    }

    // ---- transfers ----

    /// Start a chunked upload.
    pub async fn start_upload(
        &self,
        ctx: &RequestContext,
        source_id: &SourceId,
        path: &LogicalPath,
        total_size: Option<u64>,
        part_size: Option<u64>,
    ) -> Result<TransferTicket> {
        self.guarded(ctx, "start_upload", self.operation_timeout(), async {
            let (source, adapter) = self.resolve(ctx, source_id).await?;
            self.transfers
                .start_upload(
                    adapter.as_ref(),
                    &ctx.user_id,
                    &source.id,
                    path,
                    total_size,
                    part_size,
                )
                .await
        })
        .await
    }

    /// Resolve a session's source for the caller.
    async fn session_adapter(
        &self,
        ctx: &RequestContext,
        session_id: &str,
    ) -> Result<Arc<dyn StorageAdapter>> {
        let session = self.transfers.session(&ctx.user_id, session_id).await?;
        let (_, adapter) = self.resolve(ctx, &session.source_id).await?;
        Ok(adapter)
    }

    /// Upload one part; bounded by the part timeout unless the caller set one.
    pub async fn upload_part(
        &self,
        ctx: &RequestContext,
        session_id: &str,
        index: u32,
        data: Bytes,
        checksum: Option<u32>,
        last: bool,
    ) -> Result<PartAck> {
        self.guarded(ctx, "upload_part", self.config.timeouts.transfer_part(), async {
            let adapter = self.session_adapter(ctx, session_id).await?;
            self.transfers
                .upload_part(
                    adapter.as_ref(),
                    &ctx.user_id,
                    session_id,
                    index,
                    data,
                    checksum,
                    last,
                )
                .await
        })
        .await
    }

    /// Complete an upload. Succeeds once; later calls fail with `Conflict`.
    pub async fn complete_upload(&self, ctx: &RequestContext, session_id: &str) -> Result<FileEntry> {
        self.guarded(ctx, "complete_upload", self.operation_timeout(), async {
            let session = self.transfers.session(&ctx.user_id, session_id).await?;
            let (source, adapter) = self.resolve(ctx, &session.source_id).await?;
            let entry = self
                .transfers
                .complete_upload(adapter.as_ref(), &ctx.user_id, session_id)
                .await?;
            Ok(entry.with_source(&source.id))
        })
        .await
    }

    /// Abort an upload or download. Aborting twice is a no-op.
    pub async fn abort_upload(&self, ctx: &RequestContext, session_id: &str) -> Result<()> {
        self.guarded(ctx, "abort_upload", self.operation_timeout(), async {
            let session = self.transfers.session(&ctx.user_id, session_id).await?;
            // The session is closed even if its source can no longer be reached.
            let adapter = self.resolve(ctx, &session.source_id).await.ok().map(|(_, a)| a);
            self.transfers
                .abort(adapter.as_deref(), &ctx.user_id, session_id)
                .await
        })
        .await
    }

    pub async fn upload_status(&self, ctx: &RequestContext, session_id: &str) -> Result<TransferStatus> {
        self.transfers.status(&ctx.user_id, session_id).await
    }

    pub async fn list_transfers(&self, ctx: &RequestContext) -> Result<Vec<TransferStatus>> {
        self.transfers.sessions_for(&ctx.user_id).await
    }

    /// Start a resumable download.
    pub async fn start_download(
        &self,
        ctx: &RequestContext,
        source_id: &SourceId,
        path: &LogicalPath,
        part_size: Option<u64>,
    ) -> Result<TransferTicket> {
        self.guarded(ctx, "start_download", self.operation_timeout(), async {
            let (source, adapter) = self.resolve(ctx, source_id).await?;
            self.transfers
                .start_download(adapter.as_ref(), &ctx.user_id, &source.id, path, part_size)
                .await
        })
        .await
    }

    pub async fn download_part(
        &self,
        ctx: &RequestContext,
        session_id: &str,
        index: u32,
    ) -> Result<DownloadedPart> {
        self.guarded(ctx, "download_part", self.config.timeouts.transfer_part(), async {
            let adapter = self.session_adapter(ctx, session_id).await?;
            self.transfers
                .download_part(adapter.as_ref(), &ctx.user_id, session_id, index)
                .await
        })
        .await
    }

    pub async fn complete_download(
        &self,
        ctx: &RequestContext,
        session_id: &str,
    ) -> Result<TransferStatus> {
        self.transfers.complete_download(&ctx.user_id, session_id).await
    }

    /// Reload open transfer sessions after a restart.
    pub async fn recover_transfers(&self) -> Result<usize> {
        self.transfers.recover().await
    }

    // ---- janitor ----

    /// Abort idle transfers, purge old ones and abandon their provider uploads.
    pub async fn collect_idle_sessions(&self) -> Result<CollectReport> {
        let report = self.transfers.collect(Utc::now()).await?;

        for session in report.provider_uploads() {
            let Some(upload) = &session.upload else {
                continue;
            };
            let source = match self.sources.get(&session.source_id).await? {
                Some(source) => source,
                None => continue,
            };
            match self.adapter_for(&source).await {
                Ok(adapter) => {
                    self.transfers
                        .release_upload(adapter.as_ref(), &source.id, upload)
                        .await
                }
                Err(e) => warn!(source = %source.id, "Cannot release provider upload: {}", e),
            }
        }
        Ok(report)
    }

    /// Run [`collect_idle_sessions`](Self::collect_idle_sessions) every
    /// janitor interval until `shutdown` is cancelled.
    pub fn spawn_janitor(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.config.transfer.janitor_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?period, "Transfer janitor started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Transfer janitor shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.collect_idle_sessions().await {
                            error!("Transfer collection failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}
