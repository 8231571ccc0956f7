//! In-process backend.
//!
//! Keeps documents and catalog metadata in memory. Used for standalone
//! deployments and tests; it has no query, search or analytics engine.

use super::{
    BackendError, BackendEvent, BucketSettings, Cas, ClusterBackend, DocumentId, GetResult,
    MutationResult, MutationToken, QueryIndex, RemoveOptions, ScopeSpec, SearchIndex,
    UpsertOptions, MAX_VBUCKETS,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

const DEFAULT_SCOPE: &str = "_default";
const DEFAULT_COLLECTION: &str = "_default";

#[derive(Debug, Clone)]
struct StoredDoc {
    content: Bytes,
    flags: u32,
    cas: Cas,
    expiry: Option<DateTime<Utc>>,
}

impl StoredDoc {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Debug)]
struct BucketState {
    settings: BucketSettings,
    scopes: BTreeMap<String, BTreeSet<String>>,
    partition_uuid: u64,
    seqnos: Vec<u64>,
    docs: HashMap<(String, String, String), StoredDoc>,
}

impl BucketState {
    fn new(settings: BucketSettings, num_vbuckets: u32, partition_uuid: u64) -> Self {
        let mut scopes = BTreeMap::new();
        scopes.insert(
            DEFAULT_SCOPE.to_string(),
            BTreeSet::from([DEFAULT_COLLECTION.to_string()]),
        );
        Self {
            settings,
            scopes,
            partition_uuid,
            seqnos: vec![0; num_vbuckets.max(1) as usize],
            docs: HashMap::new(),
        }
    }

    fn check_collection(&self, id: &DocumentId) -> Result<(), BackendError> {
        let collections = self
            .scopes
            .get(&id.scope)
            .ok_or_else(|| BackendError::ScopeNotFound(id.scope.clone()))?;
        if !collections.contains(&id.collection) {
            return Err(BackendError::CollectionNotFound(format!(
                "{}.{}",
                id.scope, id.collection
            )));
        }
        Ok(())
    }

    fn next_token(&mut self, key: &str) -> Result<MutationToken, BackendError> {
        let vb = partition_for(key, self.seqnos.len() as u32);
        let partition_id = u16::try_from(vb).map_err(|_| {
            BackendError::Other(format!(
                "partition {} of bucket {} exceeds {} partitions",
                vb, self.settings.name, MAX_VBUCKETS
            ))
        })?;
        let seqno = &mut self.seqnos[vb as usize];
        *seqno += 1;
        Ok(MutationToken::new(
            self.settings.name.clone(),
            partition_id,
            self.partition_uuid,
            *seqno,
        ))
    }
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, BucketState>,
    search_indexes: BTreeMap<String, SearchIndex>,
    query_indexes: Vec<QueryIndex>,
    transactions: HashMap<String, String>,
}

/// Memory-resident [`ClusterBackend`].
pub struct MemoryBackend {
    num_vbuckets: u32,
    state: RwLock<State>,
    next_cas: AtomicU64,
    next_id: AtomicU64,
    events: broadcast::Sender<BackendEvent>,
}

impl MemoryBackend {
    pub fn new(num_vbuckets: u32) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            num_vbuckets,
            state: RwLock::new(State::default()),
            next_cas: AtomicU64::new(1),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    /// Create a backend with `buckets` already present.
    pub fn with_buckets<I, S>(num_vbuckets: u32, buckets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let backend = Self::new(num_vbuckets);
        {
            let mut state = backend.state.write();
            for name in buckets {
                let name = name.into();
                let settings = BucketSettings {
                    name: name.clone(),
                    ram_quota_mb: 100,
                    num_replicas: 1,
                    flush_enabled: false,
                };
                let uuid = backend.next_id.fetch_add(1, Ordering::Relaxed);
                state
                    .buckets
                    .insert(name, BucketState::new(settings, num_vbuckets, uuid));
            }
        }
        backend
    }

    pub fn num_vbuckets(&self) -> u32 {
        self.num_vbuckets
    }

    /// Catalog change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.state.read().buckets.keys().cloned().collect()
    }

    fn cas(&self) -> Cas {
        Cas(self.next_cas.fetch_add(1, Ordering::Relaxed))
    }

    fn emit(&self, event: BackendEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// vbucket a key hashes to.
fn partition_for(key: &str, num_vbuckets: u32) -> u32 {
    let hash = key
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32));
    hash % num_vbuckets.max(1)
}

fn doc_key(id: &DocumentId) -> (String, String, String) {
    (id.scope.clone(), id.collection.clone(), id.key.clone())
}

#[async_trait::async_trait]
impl ClusterBackend for MemoryBackend {
    async fn get(&self, id: &DocumentId) -> Result<GetResult, BackendError> {
        let now = Utc::now();
        let state = self.state.read();
        let bucket = state
            .buckets
            .get(&id.bucket)
            .ok_or_else(|| BackendError::BucketNotFound(id.bucket.clone()))?;
        bucket.check_collection(id)?;

        match bucket.docs.get(&doc_key(id)) {
            Some(doc) if !doc.is_expired(now) => Ok(GetResult {
                content: doc.content.clone(),
                flags: doc.flags,
                cas: doc.cas,
                expiry: doc.expiry.unwrap_or(DateTime::UNIX_EPOCH),
            }),
            _ => Err(BackendError::DocumentNotFound(id.key.clone())),
        }
    }

    async fn upsert(
        &self,
        id: &DocumentId,
        content: Bytes,
        opts: UpsertOptions,
    ) -> Result<MutationResult, BackendError> {
        let cas = self.cas();
        let mut state = self.state.write();
        let bucket = state
            .buckets
            .get_mut(&id.bucket)
            .ok_or_else(|| BackendError::BucketNotFound(id.bucket.clone()))?;
        bucket.check_collection(id)?;

        let token = bucket.next_token(&id.key)?;
        bucket.docs.insert(
            doc_key(id),
            StoredDoc {
                content,
                flags: opts.flags,
                cas,
                expiry: opts.expiry,
            },
        );
        Ok(MutationResult {
            cas,
            token: Some(token),
        })
    }

    async fn remove(
        &self,
        id: &DocumentId,
        opts: RemoveOptions,
    ) -> Result<MutationResult, BackendError> {
        let now = Utc::now();
        let cas = self.cas();
        let mut state = self.state.write();
        let bucket = state
            .buckets
            .get_mut(&id.bucket)
            .ok_or_else(|| BackendError::BucketNotFound(id.bucket.clone()))?;
        bucket.check_collection(id)?;

        let key = doc_key(id);
        match bucket.docs.get(&key) {
            Some(doc) if !doc.is_expired(now) => {
                if let Some(expected) = opts.cas {
                    if expected != doc.cas {
                        return Err(BackendError::CasMismatch(id.key.clone()));
                    }
                }
            }
            _ => return Err(BackendError::DocumentNotFound(id.key.clone())),
        }

        let token = bucket.next_token(&id.key)?;
        bucket.docs.remove(&key);
        Ok(MutationResult {
            cas,
            token: Some(token),
        })
    }

    async fn touch(&self, id: &DocumentId, expiry: Duration) -> Result<MutationResult, BackendError> {
        let now = Utc::now();
        let cas = self.cas();
        let mut state = self.state.write();
        let bucket = state
            .buckets
            .get_mut(&id.bucket)
            .ok_or_else(|| BackendError::BucketNotFound(id.bucket.clone()))?;
        bucket.check_collection(id)?;

        let doc = bucket
            .docs
            .get_mut(&doc_key(id))
            .filter(|doc| !doc.is_expired(now))
            .ok_or_else(|| BackendError::DocumentNotFound(id.key.clone()))?;

        // A zero expiry clears it.
        doc.expiry = if expiry.is_zero() {
            None
        } else {
            let delta = chrono::Duration::from_std(expiry)
                .map_err(|_| BackendError::InvalidArgument("expiry out of range".into()))?;
            Some(now + delta)
        };
        doc.cas = cas;

        // Touch does not hand out a mutation token.
        Ok(MutationResult { cas, token: None })
    }

    async fn list_buckets(&self) -> Result<Vec<BucketSettings>, BackendError> {
        Ok(self
            .state
            .read()
            .buckets
            .values()
            .map(|b| b.settings.clone())
            .collect())
    }

    async fn create_bucket(&self, settings: BucketSettings) -> Result<(), BackendError> {
        if settings.name.is_empty() {
            return Err(BackendError::InvalidArgument("bucket name cannot be empty".into()));
        }
        let name = settings.name.clone();
        {
            let mut state = self.state.write();
            if state.buckets.contains_key(&name) {
                return Err(BackendError::BucketExists(name));
            }
            let uuid = self.next_id.fetch_add(1, Ordering::Relaxed);
            state.buckets.insert(
                name.clone(),
                BucketState::new(settings, self.num_vbuckets, uuid),
            );
        }
        tracing::info!(bucket = %name, "Created bucket");
        self.emit(BackendEvent::BucketCreated(name));
        Ok(())
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), BackendError> {
        {
            let mut state = self.state.write();
            if state.buckets.remove(name).is_none() {
                return Err(BackendError::BucketNotFound(name.to_string()));
            }
            state.query_indexes.retain(|idx| idx.bucket != name);
            state.transactions.retain(|_, bucket| bucket != name);
        }
        tracing::info!(bucket = %name, "Deleted bucket");
        self.emit(BackendEvent::BucketDeleted(name.to_string()));
        Ok(())
    }

    async fn list_scopes(&self, bucket: &str) -> Result<Vec<ScopeSpec>, BackendError> {
        let state = self.state.read();
        let bucket = state
            .buckets
            .get(bucket)
            .ok_or_else(|| BackendError::BucketNotFound(bucket.to_string()))?;
        Ok(bucket
            .scopes
            .iter()
            .map(|(name, collections)| ScopeSpec {
                name: name.clone(),
                collections: collections.iter().cloned().collect(),
            })
            .collect())
    }

    async fn create_collection(
        &self,
        bucket: &str,
        scope: &str,
        collection: &str,
    ) -> Result<(), BackendError> {
        if collection.is_empty() {
            return Err(BackendError::InvalidArgument("collection name cannot be empty".into()));
        }
        let mut state = self.state.write();
        let bucket = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| BackendError::BucketNotFound(bucket.to_string()))?;
        let collections = bucket.scopes.entry(scope.to_string()).or_default();
        if !collections.insert(collection.to_string()) {
            return Err(BackendError::CollectionExists(format!("{}.{}", scope, collection)));
        }
        Ok(())
    }

    async fn delete_collection(
        &self,
        bucket: &str,
        scope: &str,
        collection: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.write();
        let bucket = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| BackendError::BucketNotFound(bucket.to_string()))?;
        let collections = bucket
            .scopes
            .get_mut(scope)
            .ok_or_else(|| BackendError::ScopeNotFound(scope.to_string()))?;
        if !collections.remove(collection) {
            return Err(BackendError::CollectionNotFound(format!("{}.{}", scope, collection)));
        }
        bucket
            .docs
            .retain(|(s, c, _), _| !(s == scope && c == collection));
        Ok(())
    }

    async fn list_search_indexes(&self) -> Result<Vec<SearchIndex>, BackendError> {
        Ok(self.state.read().search_indexes.values().cloned().collect())
    }

    async fn upsert_search_index(&self, index: SearchIndex) -> Result<(), BackendError> {
        let mut state = self.state.write();
        if !state.buckets.contains_key(&index.source_name) {
            return Err(BackendError::BucketNotFound(index.source_name));
        }
        state.search_indexes.insert(index.name.clone(), index);
        Ok(())
    }

    async fn delete_search_index(&self, name: &str) -> Result<(), BackendError> {
        self.state
            .write()
            .search_indexes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BackendError::IndexNotFound(name.to_string()))
    }

    async fn list_query_indexes(&self, bucket: Option<&str>) -> Result<Vec<QueryIndex>, BackendError> {
        Ok(self
            .state
            .read()
            .query_indexes
            .iter()
            .filter(|idx| bucket.map(|b| idx.bucket == b).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn create_primary_index(
        &self,
        bucket: &str,
        name: Option<&str>,
        ignore_if_exists: bool,
    ) -> Result<(), BackendError> {
        let name = name.unwrap_or("#primary").to_string();
        let mut state = self.state.write();
        if !state.buckets.contains_key(bucket) {
            return Err(BackendError::BucketNotFound(bucket.to_string()));
        }
        if state
            .query_indexes
            .iter()
            .any(|idx| idx.bucket == bucket && idx.name == name)
        {
            return if ignore_if_exists {
                Ok(())
            } else {
                Err(BackendError::IndexExists(name))
            };
        }
        state.query_indexes.push(QueryIndex {
            bucket: bucket.to_string(),
            name,
            is_primary: true,
            state: "online".to_string(),
        });
        Ok(())
    }

    async fn begin_transaction(&self, bucket: &str) -> Result<String, BackendError> {
        let mut state = self.state.write();
        if !state.buckets.contains_key(bucket) {
            return Err(BackendError::BucketNotFound(bucket.to_string()));
        }
        let id = format!("txn-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        state.transactions.insert(id.clone(), bucket.to_string());
        Ok(id)
    }

    async fn commit_transaction(&self, bucket: &str, id: &str) -> Result<(), BackendError> {
        self.finish_transaction(bucket, id)
    }

    async fn rollback_transaction(&self, bucket: &str, id: &str) -> Result<(), BackendError> {
        self.finish_transaction(bucket, id)
    }
}

impl MemoryBackend {
    fn finish_transaction(&self, bucket: &str, id: &str) -> Result<(), BackendError> {
        let mut state = self.state.write();
        match state.transactions.get(id) {
            Some(owner) if owner == bucket => {
                state.transactions.remove(id);
                Ok(())
            }
            _ => Err(BackendError::TransactionNotFound(id.to_string())),
        }
    }
}
