//! gRPC transport for the gateway.
//!
//! Serves two independent planes behind one interceptor policy:
//! - Data plane: Kv, Query, Search, Analytics, BucketAdmin, CollectionAdmin,
//!   SearchAdmin, QueryAdmin, Transactions, Hooks, Health
//! - Service-discovery plane: Routing, Hooks
//!
//! Wire values are translated to backend-native values in [`convert`].

pub mod proto {
    //! Generated protobuf types and service traits.

    pub mod routing {
        tonic::include_proto!("sgw.routing.v1");
    }
    pub mod kv {
        tonic::include_proto!("sgw.kv.v1");
    }
    pub mod query {
        tonic::include_proto!("sgw.query.v1");
    }
    pub mod search {
        tonic::include_proto!("sgw.search.v1");
    }
    pub mod analytics {
        tonic::include_proto!("sgw.analytics.v1");
    }
    pub mod admin_bucket {
        tonic::include_proto!("sgw.admin.bucket.v1");
    }
    pub mod admin_collection {
        tonic::include_proto!("sgw.admin.collection.v1");
    }
    pub mod admin_search {
        tonic::include_proto!("sgw.admin.search.v1");
    }
    pub mod admin_query {
        tonic::include_proto!("sgw.admin.query.v1");
    }
    pub mod transactions {
        tonic::include_proto!("sgw.transactions.v1");
    }
    pub mod hooks {
        tonic::include_proto!("sgw.internal_hooks.v1");
    }
    pub mod health {
        tonic::include_proto!("grpc.health.v1");
    }
}

pub mod backend;
pub mod convert;
pub mod dataimpl;
pub mod error;
pub mod health;
pub mod hooks;
pub mod interceptor;
pub mod plane;
pub mod recovery;
pub mod routing;
pub mod system;

pub use backend::{BackendError, ClusterBackend};
pub use dataimpl::DataServices;
pub use health::HealthReporter;
pub use hooks::HooksManager;
pub use interceptor::metrics::GatewayMetrics;
pub use interceptor::InterceptorChain;
pub use routing::RoutingService;
pub use system::{Listeners, System, SystemError, SystemOptions, MAX_MSG_SIZE};
