//! Data-plane service adapters.
//!
//! Each service validates its request, translates wire values through
//! [`crate::convert`], forwards to the [`ClusterBackend`], and maps backend
//! errors to gRPC statuses.

mod admin;
mod kv;
mod query;
mod transactions;

pub use admin::{BucketAdminService, CollectionAdminService, QueryAdminService, SearchAdminService};
pub use kv::KvService;
pub use query::{AnalyticsService, QueryService, SearchService};
pub use transactions::TransactionsService;

use crate::backend::ClusterBackend;
use std::sync::Arc;
use tonic::Status;

/// Rows (or hits) per streamed response message.
pub(crate) const ROWS_PER_MESSAGE: usize = 100;

/// Factory for the data-plane services over one backend.
#[derive(Clone)]
pub struct DataServices {
    backend: Arc<dyn ClusterBackend>,
}

impl DataServices {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn ClusterBackend> {
        &self.backend
    }

    pub fn kv(&self) -> KvService {
        KvService::new(self.backend.clone())
    }

    pub fn query(&self) -> QueryService {
        QueryService::new(self.backend.clone())
    }

    pub fn search(&self) -> SearchService {
        SearchService::new(self.backend.clone())
    }

    pub fn analytics(&self) -> AnalyticsService {
        AnalyticsService::new(self.backend.clone())
    }

    pub fn bucket_admin(&self) -> BucketAdminService {
        BucketAdminService::new(self.backend.clone())
    }

    pub fn collection_admin(&self) -> CollectionAdminService {
        CollectionAdminService::new(self.backend.clone())
    }

    pub fn search_admin(&self) -> SearchAdminService {
        SearchAdminService::new(self.backend.clone())
    }

    pub fn query_admin(&self) -> QueryAdminService {
        QueryAdminService::new(self.backend.clone())
    }

    pub fn transactions(&self) -> TransactionsService {
        TransactionsService::new(self.backend.clone())
    }
}

pub(crate) fn require(value: &str, field: &str) -> Result<(), Status> {
    if value.is_empty() {
        return Err(Status::invalid_argument(format!("{} is required", field)));
    }
    Ok(())
}
