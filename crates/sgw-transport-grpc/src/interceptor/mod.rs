//! Per-call interceptor chain.
//!
//! Every RPC on either plane passes through the same ordered chain:
//! tracing, metrics, debug (optional), hooks. `on_request` runs in chain
//! order and may short-circuit the call with a status; `on_response` runs in
//! reverse order for every interceptor whose `on_request` ran, once the
//! response body has finished (or been dropped). Panic recovery is not part
//! of the chain; it is a separate layer sitting between the chain and the
//! handlers (see [`crate::recovery`]).
//!
//! Unary and server-streaming methods get separate chain instances so the
//! two call shapes can be observed independently.

pub mod debug;
pub mod metrics;
pub mod trace;

use crate::hooks::{HooksInterceptor, HooksManager};
use bytes::Bytes;
use futures::future::BoxFuture;
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tonic::body::BoxBody;
use tonic::{Code, Status};
use tower::{Layer, Service};
use tracing::Instrument;

/// Metric label for calls to paths no registered service answers.
pub const UNKNOWN_METHOD: &str = "unknown";

/// Which listener a call arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plane {
    Data,
    ServiceDiscovery,
}

impl Plane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plane::Data => "data",
            Plane::ServiceDiscovery => "sd",
        }
    }
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Unary,
    Streaming,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Unary => "unary",
            CallKind::Streaming => "streaming",
        }
    }
}

/// State shared by the interceptors of one call.
#[derive(Debug)]
pub struct CallContext {
    pub plane: Plane,
    /// Full method path, e.g. `/sgw.kv.v1.Kv/Get`.
    pub path: String,
    /// Bounded label for the method: the path when it is registered on the
    /// plane, [`UNKNOWN_METHOD`] otherwise.
    pub method: String,
    pub kind: CallKind,
    pub headers: HeaderMap,
    pub started: Instant,
    /// Span the handler runs in. Set by the tracing interceptor.
    pub span: tracing::Span,
}

impl CallContext {
    pub fn new(plane: Plane, path: impl Into<String>, kind: CallKind, headers: HeaderMap) -> Self {
        let path = path.into();
        Self {
            plane,
            method: path.clone(),
            path,
            kind,
            headers,
            started: Instant::now(),
            span: tracing::Span::none(),
        }
    }
}

/// Result of a call as seen by the chain.
///
/// `code` is the final gRPC status: from the response headers for
/// trailers-only responses, otherwise from the trailers that end the body.
/// A body dropped before it finished reads as `Cancelled`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub code: Code,
    /// Interceptor that rejected the call before it reached the handler.
    pub short_circuited_by: Option<&'static str>,
}

/// One link of the chain.
pub trait CallInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspect the call before the handler runs. Returning an error ends
    /// the call with that status.
    fn on_request(&self, _ctx: &mut CallContext) -> Result<(), Status> {
        Ok(())
    }

    fn on_response(&self, _ctx: &CallContext, _outcome: &CallOutcome) {}
}

/// Ordered interceptor lists for unary and streaming calls.
#[derive(Clone)]
pub struct InterceptorChain {
    unary: Vec<Arc<dyn CallInterceptor>>,
    streaming: Vec<Arc<dyn CallInterceptor>>,
}

impl InterceptorChain {
    /// Build the gateway's fixed chain.
    pub fn build(metrics: Arc<metrics::GatewayMetrics>, hooks: Arc<HooksManager>, debug: bool) -> Self {
        let make = |kind: CallKind| {
            let mut chain: Vec<Arc<dyn CallInterceptor>> = vec![
                Arc::new(trace::TracingInterceptor),
                Arc::new(metrics::MetricsInterceptor::new(metrics.clone(), kind)),
            ];
            if debug {
                chain.push(Arc::new(debug::DebugInterceptor));
            }
            chain.push(Arc::new(HooksInterceptor::new(hooks.clone())));
            chain
        };
        Self {
            unary: make(CallKind::Unary),
            streaming: make(CallKind::Streaming),
        }
    }

    /// Chain from explicit interceptor lists.
    pub fn from_parts(
        unary: Vec<Arc<dyn CallInterceptor>>,
        streaming: Vec<Arc<dyn CallInterceptor>>,
    ) -> Self {
        Self { unary, streaming }
    }

    pub fn interceptors(&self, kind: CallKind) -> &[Arc<dyn CallInterceptor>] {
        match kind {
            CallKind::Unary => &self.unary,
            CallKind::Streaming => &self.streaming,
        }
    }

    /// Names in execution order, ending with the recovery layer that wraps
    /// the handlers.
    pub fn names(&self, kind: CallKind) -> Vec<&'static str> {
        self.interceptors(kind)
            .iter()
            .map(|i| i.name())
            .chain(std::iter::once(crate::recovery::NAME))
            .collect()
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("unary", &self.names(CallKind::Unary))
            .field("streaming", &self.names(CallKind::Streaming))
            .finish()
    }
}

/// Tower layer running an [`InterceptorChain`] around a plane's routes.
#[derive(Clone)]
pub struct InterceptorLayer {
    plane: Plane,
    chain: Arc<InterceptorChain>,
    methods: Arc<HashMap<String, CallKind>>,
}

impl InterceptorLayer {
    /// `methods` maps every registered full path to its call shape.
    pub fn new(plane: Plane, chain: Arc<InterceptorChain>, methods: HashMap<String, CallKind>) -> Self {
        Self {
            plane,
            chain,
            methods: Arc::new(methods),
        }
    }
}

impl<S> Layer<S> for InterceptorLayer {
    type Service = InterceptorService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InterceptorService {
            inner,
            layer: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct InterceptorService<S> {
    inner: S,
    layer: InterceptorLayer,
}

impl<S, ReqBody> Service<http::Request<ReqBody>> for InterceptorService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        // The ready service goes into the future; keep a fresh clone.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let path = req.uri().path().to_string();
        let registered = self.layer.methods.get(&path).copied();
        let kind = registered.unwrap_or(CallKind::Unary);
        let chain = self.layer.chain.clone();
        let mut ctx = CallContext::new(self.layer.plane, path, kind, req.headers().clone());
        if registered.is_none() {
            ctx.method = UNKNOWN_METHOD.to_string();
        }

        Box::pin(async move {
            let mut entered = 0;
            let mut rejected = None;
            for interceptor in chain.interceptors(kind) {
                entered += 1;
                if let Err(status) = interceptor.on_request(&mut ctx) {
                    rejected = Some((interceptor.name(), status));
                    break;
                }
            }

            let span = ctx.span.clone();
            let mut pending = PendingCall::new(chain, entered, ctx);
            if let Some((name, status)) = rejected {
                pending.short_circuit(name, status.code());
                return Ok(status_response(status));
            }

            match inner.call(req).instrument(span).await {
                Ok(response) => Ok(pending.observe(response)),
                Err(err) => {
                    pending.finish(Code::Unknown);
                    Err(err)
                }
            }
        })
    }
}

struct Completion {
    chain: Arc<InterceptorChain>,
    entered: usize,
    ctx: CallContext,
}

/// The `on_response` half of one call. Runs at most once; dropping it
/// unfinished completes the call as `Cancelled`.
struct PendingCall(Option<Completion>);

impl PendingCall {
    fn new(chain: Arc<InterceptorChain>, entered: usize, ctx: CallContext) -> Self {
        Self(Some(Completion { chain, entered, ctx }))
    }

    fn finish(&mut self, code: Code) {
        self.complete(CallOutcome {
            code,
            short_circuited_by: None,
        });
    }

    fn short_circuit(&mut self, name: &'static str, code: Code) {
        self.complete(CallOutcome {
            code,
            short_circuited_by: Some(name),
        });
    }

    fn complete(&mut self, outcome: CallOutcome) {
        let Some(call) = self.0.take() else {
            return;
        };
        let interceptors = call.chain.interceptors(call.ctx.kind);
        for interceptor in interceptors[..call.entered].iter().rev() {
            interceptor.on_response(&call.ctx, &outcome);
        }
    }

    /// Complete now for trailers-only or empty responses; otherwise hand the
    /// call to the body so it completes when the stream ends.
    fn observe(mut self, response: http::Response<BoxBody>) -> http::Response<BoxBody> {
        if response.headers().contains_key("grpc-status") || response.body().is_end_stream() {
            self.finish(response_code(response.headers()));
            return response;
        }
        response.map(|inner| {
            tonic::body::boxed(ObservedBody {
                inner,
                pending: self,
            })
        })
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.finish(Code::Cancelled);
    }
}

/// Response body that completes its call with the status in the trailers.
struct ObservedBody {
    inner: BoxBody,
    pending: PendingCall,
}

impl Body for ObservedBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(trailers) = frame.trailers_ref() {
                    self.pending.finish(response_code(trailers));
                }
            }
            Poll::Ready(Some(Err(status))) => self.pending.finish(status.code()),
            Poll::Ready(None) => self.pending.finish(Code::Ok),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// gRPC status carried in a header or trailer map, `Ok` if there is none.
fn response_code(headers: &HeaderMap) -> Code {
    headers
        .get("grpc-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i32>().ok())
        .map(Code::from_i32)
        .unwrap_or(Code::Ok)
}

/// Write `status` into a header or trailer map.
pub(crate) fn encode_status(status: &Status, headers: &mut HeaderMap) {
    if let Err(err) = status.add_header(headers) {
        tracing::warn!(error = %err, "Failed to encode status headers");
        headers.insert("grpc-status", http::HeaderValue::from(Code::Internal as i32));
    }
}

/// Trailers-only gRPC response carrying `status`.
pub(crate) fn status_response(status: Status) -> http::Response<BoxBody> {
    let mut response = http::Response::new(tonic::body::empty_body());
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    encode_status(&status, headers);
    response
}
