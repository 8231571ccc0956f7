//! Backend abstraction for data-plane services.
//!
//! [`ClusterBackend`] is the seam between the gRPC adapters and whatever
//! driver talks to the document-store cluster. Values crossing it use the
//! backend's native representations (see [`crate::convert`] for the wire
//! mappings).

pub mod memory;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub use memory::MemoryBackend;

/// Opaque document version token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Cas(pub u64);

/// Largest partition count a mutation receipt can identify.
pub const MAX_VBUCKETS: u32 = u16::MAX as u32 + 1;

/// Receipt for a completed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationToken {
    bucket_name: String,
    partition_id: u16,
    partition_uuid: u64,
    sequence_number: u64,
}

impl MutationToken {
    pub fn new(
        bucket_name: impl Into<String>,
        partition_id: u16,
        partition_uuid: u64,
        sequence_number: u64,
    ) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            partition_id,
            partition_uuid,
            sequence_number,
        }
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    pub fn partition_id(&self) -> u16 {
        self.partition_id
    }

    pub fn partition_uuid(&self) -> u64 {
        self.partition_uuid
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
}

/// Backend durability requirement for a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityLevel {
    #[default]
    None,
    Majority,
    MajorityAndPersistOnMaster,
    PersistToMajority,
}

/// Fully-qualified document address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
    pub key: String,
}

impl DocumentId {
    /// Empty scope/collection names resolve to `_default`.
    pub fn new(bucket: &str, scope: &str, collection: &str, key: &str) -> Self {
        let or_default = |s: &str| {
            if s.is_empty() {
                "_default".to_string()
            } else {
                s.to_string()
            }
        };
        Self {
            bucket: bucket.to_string(),
            scope: or_default(scope),
            collection: or_default(collection),
            key: key.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GetResult {
    pub content: Bytes,
    pub flags: u32,
    pub cas: Cas,
    /// Absolute expiry. Documents without expiry report the zero instant or
    /// the Unix epoch, depending on the code path that produced them.
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MutationResult {
    pub cas: Cas,
    /// Absent when the server did not hand out a mutation token.
    pub token: Option<MutationToken>,
}

#[derive(Debug, Clone, Default)]
pub struct UpsertOptions {
    pub flags: u32,
    pub expiry: Option<DateTime<Utc>>,
    pub durability: DurabilityLevel,
}

#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    pub cas: Option<Cas>,
    pub durability: DurabilityLevel,
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub bucket: Option<String>,
    pub positional_parameters: Vec<Bytes>,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub request_id: String,
    pub rows: Vec<Bytes>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub index: String,
    pub id: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub hits: Vec<SearchHit>,
    pub total_hits: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSettings {
    pub name: String,
    pub ram_quota_mb: u64,
    pub num_replicas: u32,
    pub flush_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeSpec {
    pub name: String,
    pub collections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchIndex {
    pub name: String,
    pub source_name: String,
    pub index_type: String,
    pub params: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryIndex {
    pub bucket: String,
    pub name: String,
    pub is_primary: bool,
    pub state: String,
}

/// Change notifications a backend emits about its own catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    BucketCreated(String),
    BucketDeleted(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Document exists: {0}")]
    DocumentExists(String),

    #[error("CAS mismatch on {0}")]
    CasMismatch(String),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Bucket exists: {0}")]
    BucketExists(String),

    #[error("Scope not found: {0}")]
    ScopeNotFound(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Collection exists: {0}")]
    CollectionExists(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Index exists: {0}")]
    IndexExists(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(&'static str),

    #[error("Operation timed out")]
    Timeout,

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Backend error: {0}")]
    Other(String),
}

/// Operations the data plane forwards to the cluster.
///
/// Query, search and analytics default to [`BackendError::Unsupported`] so
/// a backend without those engines only implements the KV and catalog
/// operations.
#[async_trait::async_trait]
pub trait ClusterBackend: Send + Sync {
    async fn get(&self, id: &DocumentId) -> Result<GetResult, BackendError>;

    async fn upsert(
        &self,
        id: &DocumentId,
        content: Bytes,
        opts: UpsertOptions,
    ) -> Result<MutationResult, BackendError>;

    async fn remove(&self, id: &DocumentId, opts: RemoveOptions)
        -> Result<MutationResult, BackendError>;

    async fn touch(&self, id: &DocumentId, expiry: Duration) -> Result<MutationResult, BackendError>;

    async fn query(&self, _statement: &str, _opts: QueryOptions) -> Result<QueryResult, BackendError> {
        Err(BackendError::Unsupported("query"))
    }

    async fn search(
        &self,
        _index: &str,
        _query: &str,
        _limit: u32,
    ) -> Result<SearchResult, BackendError> {
        Err(BackendError::Unsupported("search"))
    }

    async fn analytics(
        &self,
        _statement: &str,
        _opts: QueryOptions,
    ) -> Result<QueryResult, BackendError> {
        Err(BackendError::Unsupported("analytics"))
    }

    async fn list_buckets(&self) -> Result<Vec<BucketSettings>, BackendError>;

    async fn create_bucket(&self, settings: BucketSettings) -> Result<(), BackendError>;

    async fn delete_bucket(&self, name: &str) -> Result<(), BackendError>;

    async fn list_scopes(&self, bucket: &str) -> Result<Vec<ScopeSpec>, BackendError>;

    async fn create_collection(
        &self,
        bucket: &str,
        scope: &str,
        collection: &str,
    ) -> Result<(), BackendError>;

    async fn delete_collection(
        &self,
        bucket: &str,
        scope: &str,
        collection: &str,
    ) -> Result<(), BackendError>;

    async fn list_search_indexes(&self) -> Result<Vec<SearchIndex>, BackendError>;

    async fn upsert_search_index(&self, index: SearchIndex) -> Result<(), BackendError>;

    async fn delete_search_index(&self, name: &str) -> Result<(), BackendError>;

    async fn list_query_indexes(&self, bucket: Option<&str>) -> Result<Vec<QueryIndex>, BackendError>;

    async fn create_primary_index(
        &self,
        bucket: &str,
        name: Option<&str>,
        ignore_if_exists: bool,
    ) -> Result<(), BackendError>;

    async fn begin_transaction(&self, bucket: &str) -> Result<String, BackendError>;

    async fn commit_transaction(&self, bucket: &str, id: &str) -> Result<(), BackendError>;

    async fn rollback_transaction(&self, bucket: &str, id: &str) -> Result<(), BackendError>;
}
