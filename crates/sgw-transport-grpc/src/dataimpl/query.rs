//! Query, Search and Analytics services.
//!
//! All three return server streams. The backend hands back complete result
//! sets; they are split into messages of at most [`ROWS_PER_MESSAGE`] rows,
//! and the last message carries the result metadata.

use super::{require, ROWS_PER_MESSAGE};
use crate::backend::{ClusterBackend, QueryOptions};
use crate::convert::duration_from_backend;
use crate::proto::analytics::{
    analytics_server::Analytics, AnalyticsQueryRequest, AnalyticsQueryResponse,
};
use crate::proto::query::{query_server::Query, QueryMetaData, QueryRequest, QueryResponse};
use crate::proto::search::{
    search_server::Search, SearchHit, SearchQueryRequest, SearchQueryResponse,
};
use bytes::Bytes;
use std::sync::Arc;
use tonic::{Request, Response, Status};

type RowStream<T> = tokio_stream::Iter<std::vec::IntoIter<Result<T, Status>>>;

/// Split `items` into messages, always producing at least one.
fn chunked<I, T, F>(items: Vec<I>, mut message: F) -> Vec<T>
where
    I: Clone,
    F: FnMut(Vec<I>) -> T,
{
    if items.is_empty() {
        return vec![message(Vec::new())];
    }
    items
        .chunks(ROWS_PER_MESSAGE)
        .map(|chunk| message(chunk.to_vec()))
        .collect()
}

fn stream<T>(messages: Vec<T>) -> RowStream<T> {
    tokio_stream::iter(messages.into_iter().map(Ok).collect::<Vec<_>>())
}

pub struct QueryService {
    backend: Arc<dyn ClusterBackend>,
}

impl QueryService {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self { backend }
    }
}

#[tonic::async_trait]
impl Query for QueryService {
    type QueryStream = RowStream<QueryResponse>;

    async fn query(
        &self,
        request: Request<QueryRequest>,
    ) -> Result<Response<Self::QueryStream>, Status> {
        let req = request.into_inner();
        require(&req.statement, "statement")?;

        let opts = QueryOptions {
            bucket: req.bucket_name,
            positional_parameters: req.positional_parameters.into_iter().map(Bytes::from).collect(),
            read_only: req.read_only.unwrap_or(false),
        };
        let result = self.backend.query(&req.statement, opts).await?;
        let result_count = result.rows.len() as u64;

        let mut messages = chunked(result.rows, |rows| QueryResponse {
            rows: rows.into_iter().map(|r| r.to_vec()).collect(),
            meta_data: None,
        });
        if let Some(last) = messages.last_mut() {
            last.meta_data = Some(QueryMetaData {
                request_id: result.request_id,
                elapsed_time: Some(duration_from_backend(result.elapsed)),
                result_count,
            });
        }
        Ok(Response::new(stream(messages)))
    }
}

pub struct SearchService {
    backend: Arc<dyn ClusterBackend>,
}

impl SearchService {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self { backend }
    }
}

#[tonic::async_trait]
impl Search for SearchService {
    type SearchQueryStream = RowStream<SearchQueryResponse>;

    async fn search_query(
        &self,
        request: Request<SearchQueryRequest>,
    ) -> Result<Response<Self::SearchQueryStream>, Status> {
        let req = request.into_inner();
        require(&req.index_name, "index_name")?;

        let result = self.backend.search(&req.index_name, &req.query, req.limit).await?;
        let mut messages = chunked(result.hits, |hits| SearchQueryResponse {
            hits: hits
                .into_iter()
                .map(|h| SearchHit {
                    index: h.index,
                    id: h.id,
                    score: h.score,
                })
                .collect(),
            total_hits: None,
        });
        if let Some(last) = messages.last_mut() {
            last.total_hits = Some(result.total_hits);
        }
        Ok(Response::new(stream(messages)))
    }
}

pub struct AnalyticsService {
    backend: Arc<dyn ClusterBackend>,
}

impl AnalyticsService {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self { backend }
    }
}

#[tonic::async_trait]
impl Analytics for AnalyticsService {
    type AnalyticsQueryStream = RowStream<AnalyticsQueryResponse>;

    async fn analytics_query(
        &self,
        request: Request<AnalyticsQueryRequest>,
    ) -> Result<Response<Self::AnalyticsQueryStream>, Status> {
        let req = request.into_inner();
        require(&req.statement, "statement")?;

        let opts = QueryOptions {
            bucket: req.bucket_name,
            positional_parameters: Vec::new(),
            read_only: req.read_only.unwrap_or(false),
        };
        let result = self.backend.analytics(&req.statement, opts).await?;

        let mut messages = chunked(result.rows, |rows| AnalyticsQueryResponse {
            rows: rows.into_iter().map(|r| r.to_vec()).collect(),
            elapsed_time: None,
        });
        if let Some(last) = messages.last_mut() {
            last.elapsed_time = Some(duration_from_backend(result.elapsed));
        }
        Ok(Response::new(stream(messages)))
    }
}
