//! Transactions service.

use super::require;
use crate::backend::ClusterBackend;
use crate::proto::transactions::{
    transactions_server::Transactions, BeginTransactionRequest, BeginTransactionResponse,
    CommitTransactionRequest, CommitTransactionResponse, RollbackTransactionRequest,
    RollbackTransactionResponse,
};
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub struct TransactionsService {
    backend: Arc<dyn ClusterBackend>,
}

impl TransactionsService {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self { backend }
    }
}

#[tonic::async_trait]
impl Transactions for TransactionsService {
    async fn begin_transaction(
        &self,
        request: Request<BeginTransactionRequest>,
    ) -> Result<Response<BeginTransactionResponse>, Status> {
        let req = request.into_inner();
        require(&req.bucket_name, "bucket_name")?;
        let transaction_id = self.backend.begin_transaction(&req.bucket_name).await?;
        tracing::debug!(bucket = %req.bucket_name, %transaction_id, "Transaction started");
        Ok(Response::new(BeginTransactionResponse { transaction_id }))
    }

    async fn commit_transaction(
        &self,
        request: Request<CommitTransactionRequest>,
    ) -> Result<Response<CommitTransactionResponse>, Status> {
        let req = request.into_inner();
        require(&req.transaction_id, "transaction_id")?;
        self.backend
            .commit_transaction(&req.bucket_name, &req.transaction_id)
            .await?;
        Ok(Response::new(CommitTransactionResponse {}))
    }

    async fn rollback_transaction(
        &self,
        request: Request<RollbackTransactionRequest>,
    ) -> Result<Response<RollbackTransactionResponse>, Status> {
        let req = request.into_inner();
        require(&req.transaction_id, "transaction_id")?;
        self.backend
            .rollback_transaction(&req.bucket_name, &req.transaction_id)
            .await?;
        Ok(Response::new(RollbackTransactionResponse {}))
    }
}
