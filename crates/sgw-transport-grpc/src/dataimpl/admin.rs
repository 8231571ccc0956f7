//! Management services: buckets, collections, search and query indexes.

use super::require;
use crate::backend::{BucketSettings, ClusterBackend, SearchIndex};
use crate::proto::{admin_bucket, admin_collection, admin_query, admin_search};
use admin_bucket::bucket_admin_server::BucketAdmin;
use admin_collection::collection_admin_server::CollectionAdmin;
use admin_query::query_admin_server::QueryAdmin;
use admin_search::search_admin_server::SearchAdmin;
use bytes::Bytes;
use std::sync::Arc;
use tonic::{Request, Response, Status};

const DEFAULT_RAM_QUOTA_MB: u64 = 100;
const DEFAULT_NUM_REPLICAS: u32 = 1;

pub struct BucketAdminService {
    backend: Arc<dyn ClusterBackend>,
}

impl BucketAdminService {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self { backend }
    }
}

#[tonic::async_trait]
impl BucketAdmin for BucketAdminService {
    async fn list_buckets(
        &self,
        _request: Request<admin_bucket::ListBucketsRequest>,
    ) -> Result<Response<admin_bucket::ListBucketsResponse>, Status> {
        let buckets = self
            .backend
            .list_buckets()
            .await?
            .into_iter()
            .map(|b| admin_bucket::Bucket {
                bucket_name: b.name,
                ram_quota_mb: b.ram_quota_mb,
                num_replicas: b.num_replicas,
                flush_enabled: b.flush_enabled,
            })
            .collect();
        Ok(Response::new(admin_bucket::ListBucketsResponse { buckets }))
    }

    async fn create_bucket(
        &self,
        request: Request<admin_bucket::CreateBucketRequest>,
    ) -> Result<Response<admin_bucket::CreateBucketResponse>, Status> {
        let req = request.into_inner();
        require(&req.bucket_name, "bucket_name")?;

        let settings = BucketSettings {
            name: req.bucket_name,
            ram_quota_mb: if req.ram_quota_mb == 0 {
                DEFAULT_RAM_QUOTA_MB
            } else {
                req.ram_quota_mb
            },
            num_replicas: req.num_replicas.unwrap_or(DEFAULT_NUM_REPLICAS),
            flush_enabled: req.flush_enabled.unwrap_or(false),
        };
        tracing::info!(bucket = %settings.name, replicas = settings.num_replicas, "CreateBucket");
        self.backend.create_bucket(settings).await?;
        Ok(Response::new(admin_bucket::CreateBucketResponse {}))
    }

    async fn delete_bucket(
        &self,
        request: Request<admin_bucket::DeleteBucketRequest>,
    ) -> Result<Response<admin_bucket::DeleteBucketResponse>, Status> {
        let req = request.into_inner();
        require(&req.bucket_name, "bucket_name")?;
        tracing::info!(bucket = %req.bucket_name, "DeleteBucket");
        self.backend.delete_bucket(&req.bucket_name).await?;
        Ok(Response::new(admin_bucket::DeleteBucketResponse {}))
    }
}

pub struct CollectionAdminService {
    backend: Arc<dyn ClusterBackend>,
}

impl CollectionAdminService {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self { backend }
    }
}

#[tonic::async_trait]
impl CollectionAdmin for CollectionAdminService {
    async fn list_collections(
        &self,
        request: Request<admin_collection::ListCollectionsRequest>,
    ) -> Result<Response<admin_collection::ListCollectionsResponse>, Status> {
        let req = request.into_inner();
        require(&req.bucket_name, "bucket_name")?;
        let scopes = self
            .backend
            .list_scopes(&req.bucket_name)
            .await?
            .into_iter()
            .map(|s| admin_collection::Scope {
                name: s.name,
                collections: s.collections,
            })
            .collect();
        Ok(Response::new(admin_collection::ListCollectionsResponse { scopes }))
    }

    async fn create_collection(
        &self,
        request: Request<admin_collection::CreateCollectionRequest>,
    ) -> Result<Response<admin_collection::CreateCollectionResponse>, Status> {
        let req = request.into_inner();
        require(&req.bucket_name, "bucket_name")?;
        require(&req.scope_name, "scope_name")?;
        require(&req.collection_name, "collection_name")?;
        self.backend
            .create_collection(&req.bucket_name, &req.scope_name, &req.collection_name)
            .await?;
        Ok(Response::new(admin_collection::CreateCollectionResponse {}))
    }

    async fn delete_collection(
        &self,
        request: Request<admin_collection::DeleteCollectionRequest>,
    ) -> Result<Response<admin_collection::DeleteCollectionResponse>, Status> {
        let req = request.into_inner();
        require(&req.bucket_name, "bucket_name")?;
        require(&req.scope_name, "scope_name")?;
        require(&req.collection_name, "collection_name")?;
        self.backend
            .delete_collection(&req.bucket_name, &req.scope_name, &req.collection_name)
            .await?;
        Ok(Response::new(admin_collection::DeleteCollectionResponse {}))
    }
}

pub struct SearchAdminService {
    backend: Arc<dyn ClusterBackend>,
}

impl SearchAdminService {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self { backend }
    }
}

#[tonic::async_trait]
impl SearchAdmin for SearchAdminService {
    async fn list_indexes(
        &self,
        _request: Request<admin_search::ListIndexesRequest>,
    ) -> Result<Response<admin_search::ListIndexesResponse>, Status> {
        let indexes = self
            .backend
            .list_search_indexes()
            .await?
            .into_iter()
            .map(|i| admin_search::Index {
                name: i.name,
                source_name: i.source_name,
                r#type: i.index_type,
                params: i.params.to_vec(),
            })
            .collect();
        Ok(Response::new(admin_search::ListIndexesResponse { indexes }))
    }

    async fn upsert_index(
        &self,
        request: Request<admin_search::UpsertIndexRequest>,
    ) -> Result<Response<admin_search::UpsertIndexResponse>, Status> {
        let index = request
            .into_inner()
            .index
            .ok_or_else(|| Status::invalid_argument("index is required"))?;
        require(&index.name, "index.name")?;
        require(&index.source_name, "index.source_name")?;

        self.backend
            .upsert_search_index(SearchIndex {
                name: index.name,
                source_name: index.source_name,
                index_type: if index.r#type.is_empty() {
                    "fulltext-index".to_string()
                } else {
                    index.r#type
                },
                params: Bytes::from(index.params),
            })
            .await?;
        Ok(Response::new(admin_search::UpsertIndexResponse {}))
    }

    async fn delete_index(
        &self,
        request: Request<admin_search::DeleteIndexRequest>,
    ) -> Result<Response<admin_search::DeleteIndexResponse>, Status> {
        let req = request.into_inner();
        require(&req.name, "name")?;
        self.backend.delete_search_index(&req.name).await?;
        Ok(Response::new(admin_search::DeleteIndexResponse {}))
    }
}

pub struct QueryAdminService {
    backend: Arc<dyn ClusterBackend>,
}

impl QueryAdminService {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self { backend }
    }
}

#[tonic::async_trait]
impl QueryAdmin for QueryAdminService {
    async fn get_all_indexes(
        &self,
        request: Request<admin_query::GetAllIndexesRequest>,
    ) -> Result<Response<admin_query::GetAllIndexesResponse>, Status> {
        let req = request.into_inner();
        let indexes = self
            .backend
            .list_query_indexes(req.bucket_name.as_deref())
            .await?
            .into_iter()
            .map(|i| admin_query::Index {
                bucket_name: i.bucket,
                name: i.name,
                is_primary: i.is_primary,
                state: i.state,
            })
            .collect();
        Ok(Response::new(admin_query::GetAllIndexesResponse { indexes }))
    }

    async fn create_primary_index(
        &self,
        request: Request<admin_query::CreatePrimaryIndexRequest>,
    ) -> Result<Response<admin_query::CreatePrimaryIndexResponse>, Status> {
        let req = request.into_inner();
        require(&req.bucket_name, "bucket_name")?;
        self.backend
            .create_primary_index(
                &req.bucket_name,
                req.name.as_deref(),
                req.ignore_if_exists.unwrap_or(false),
            )
            .await?;
        Ok(Response::new(admin_query::CreatePrimaryIndexResponse {}))
    }
}
