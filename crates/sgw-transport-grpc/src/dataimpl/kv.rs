//! KV service: document get and mutations.

use super::require;
use crate::backend::{ClusterBackend, DocumentId, RemoveOptions, UpsertOptions};
use crate::convert::{
    cas_from_backend, cas_to_backend, duration_to_backend, durability_to_backend,
    time_from_backend, time_to_backend, token_from_backend,
};
use crate::proto::kv::{
    kv_server::Kv, GetRequest, GetResponse, RemoveRequest, RemoveResponse, TouchRequest,
    TouchResponse, UpsertRequest, UpsertResponse,
};
use bytes::Bytes;
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// Longest accepted document key, in bytes.
const MAX_KEY_SIZE: usize = 250;

pub struct KvService {
    backend: Arc<dyn ClusterBackend>,
}

impl KvService {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self { backend }
    }
}

fn document_id(bucket: &str, scope: &str, collection: &str, key: &str) -> Result<DocumentId, Status> {
    require(bucket, "bucket_name")?;
    require(key, "key")?;
    if key.len() > MAX_KEY_SIZE {
        return Err(Status::invalid_argument(format!(
            "Key size {} exceeds limit {}",
            key.len(),
            MAX_KEY_SIZE
        )));
    }
    Ok(DocumentId::new(bucket, scope, collection, key))
}

#[tonic::async_trait]
impl Kv for KvService {
    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        let id = document_id(&req.bucket_name, &req.scope_name, &req.collection_name, &req.key)?;

        let result = self.backend.get(&id).await?;
        Ok(Response::new(GetResponse {
            content: result.content.to_vec(),
            content_flags: result.flags,
            cas: cas_from_backend(result.cas),
            expiry: time_from_backend(result.expiry),
        }))
    }

    async fn upsert(
        &self,
        request: Request<UpsertRequest>,
    ) -> Result<Response<UpsertResponse>, Status> {
        let req = request.into_inner();
        let id = document_id(&req.bucket_name, &req.scope_name, &req.collection_name, &req.key)?;
        let opts = UpsertOptions {
            flags: req.content_flags,
            expiry: req.expiry.as_ref().map(time_to_backend),
            durability: durability_to_backend(req.durability_level)?,
        };

        tracing::debug!(bucket = %id.bucket, key_len = id.key.len(), value_len = req.content.len(), "Upsert");
        let result = self.backend.upsert(&id, Bytes::from(req.content), opts).await?;
        Ok(Response::new(UpsertResponse {
            cas: cas_from_backend(result.cas),
            mutation_token: token_from_backend(result.token.as_ref()),
        }))
    }

    async fn remove(
        &self,
        request: Request<RemoveRequest>,
    ) -> Result<Response<RemoveResponse>, Status> {
        let req = request.into_inner();
        let id = document_id(&req.bucket_name, &req.scope_name, &req.collection_name, &req.key)?;
        let opts = RemoveOptions {
            cas: req.cas.map(cas_to_backend),
            durability: durability_to_backend(req.durability_level)?,
        };

        let result = self.backend.remove(&id, opts).await?;
        Ok(Response::new(RemoveResponse {
            cas: cas_from_backend(result.cas),
            mutation_token: token_from_backend(result.token.as_ref()),
        }))
    }

    async fn touch(&self, request: Request<TouchRequest>) -> Result<Response<TouchResponse>, Status> {
        let req = request.into_inner();
        let id = document_id(&req.bucket_name, &req.scope_name, &req.collection_name, &req.key)?;
        let expiry = req
            .expiry
            .as_ref()
            .map(duration_to_backend)
            .ok_or_else(|| Status::invalid_argument("expiry is required"))?;

        let result = self.backend.touch(&id, expiry).await?;
        Ok(Response::new(TouchResponse {
            cas: cas_from_backend(result.cas),
            mutation_token: token_from_backend(result.token.as_ref()),
        }))
    }
}
