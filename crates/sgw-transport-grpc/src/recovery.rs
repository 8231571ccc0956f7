//! Panic recovery.
//!
//! Innermost layer around the routed handlers. A panic while producing a
//! response, or while its body is being streamed, is caught, logged with its
//! payload, and turned into an `Internal` status so the connection and the
//! plane keep serving. Streams fed by a spawned producer task use
//! [`spawn_producer`] for the same treatment.

use crate::error::INTERNAL_ERROR_MESSAGE;
use crate::interceptor::{encode_status, status_response};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tonic::body::BoxBody;
use tonic::Status;
use tower::{Layer, Service};

/// Name reported for this layer in chain listings.
pub const NAME: &str = "recovery";

#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryLayer;

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryService<S> {
    inner: S,
}

impl<S, ReqBody> Service<http::Request<ReqBody>> for RecoveryService<S>
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
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let method = req.uri().path().to_string();

        Box::pin(async move {
            // Handlers may also panic synchronously inside `call`.
            let call = std::panic::catch_unwind(AssertUnwindSafe(|| inner.call(req)));
            let outcome = match call {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(payload) => Err(payload),
            };
            match outcome {
                Ok(Ok(response)) => Ok(response.map(|inner| {
                    tonic::body::boxed(RecoveryBody {
                        inner,
                        method,
                        panicked: false,
                    })
                })),
                Ok(Err(err)) => Err(err),
                Err(payload) => {
                    log_panic(&method, payload.as_ref());
                    Ok(status_response(internal()))
                }
            }
        })
    }
}

/// Response body that ends the stream with an `Internal` status if polling
/// the handler's body panics.
struct RecoveryBody {
    inner: BoxBody,
    method: String,
    panicked: bool,
}

impl Body for RecoveryBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.panicked {
            return Poll::Ready(None);
        }
        let inner = &mut self.inner;
        match std::panic::catch_unwind(AssertUnwindSafe(|| Pin::new(inner).poll_frame(cx))) {
            Ok(polled) => polled,
            Err(payload) => {
                self.panicked = true;
                log_panic(&self.method, payload.as_ref());
                let mut trailers = HeaderMap::new();
                encode_status(&internal(), &mut trailers);
                Poll::Ready(Some(Ok(Frame::trailers(trailers))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.panicked || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Spawn the task feeding a streamed response through `tx`. If the task
/// panics the stream ends with an `Internal` status instead of closing as
/// if it had finished.
pub fn spawn_producer<T, F, Fut>(method: &'static str, tx: mpsc::Sender<Result<T, Status>>, producer: F)
where
    T: Send + 'static,
    F: FnOnce(mpsc::Sender<Result<T, Status>>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let guard = tx.clone();
    let task = producer(tx);
    tokio::spawn(async move {
        if let Err(payload) = AssertUnwindSafe(task).catch_unwind().await {
            log_panic(method, payload.as_ref());
            let _ = guard.send(Err(internal())).await;
        }
    });
}

fn internal() -> Status {
    Status::internal(INTERNAL_ERROR_MESSAGE)
}

fn log_panic(method: &str, payload: &(dyn Any + Send)) {
    tracing::error!(
        method = %method,
        panic = %panic_message(payload),
        "A panic has been triggered"
    );
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use tower::ServiceExt;

    #[derive(Clone)]
    struct Panicky;

    impl Service<http::Request<()>> for Panicky {
        type Response = http::Response<BoxBody>;
        type Error = Infallible;
        type Future = BoxFuture<'static, Result<Self::Response, Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<()>) -> Self::Future {
            let path = req.uri().path().to_string();
            Box::pin(async move {
                if path == "/boom" {
                    panic!("handler exploded");
                }
                if path == "/stream" {
                    return Ok(http::Response::new(tonic::body::boxed(Exploding)));
                }
                Ok(http::Response::new(tonic::body::empty_body()))
            })
        }
    }

    /// Body whose producer panics on first poll.
    struct Exploding;

    impl Body for Exploding {
        type Data = Bytes;
        type Error = Status;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Status>>> {
            panic!("stream exploded");
        }
    }

    async fn next_frame(body: &mut BoxBody) -> Option<Result<Frame<Bytes>, Status>> {
        futures::future::poll_fn(|cx| Pin::new(&mut *body).poll_frame(cx)).await
    }

    fn request(path: &str) -> http::Request<()> {
        http::Request::builder().uri(path).body(()).unwrap()
    }

    #[tokio::test]
    async fn test_panic_becomes_internal() {
        let response = RecoveryLayer
            .layer(Panicky)
            .oneshot(request("/boom"))
            .await
            .unwrap();
        let status = Status::from_header_map(response.headers()).unwrap();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(status.message(), INTERNAL_ERROR_MESSAGE);
    }

    #[tokio::test]
    async fn test_normal_calls_pass_through() {
        let response = RecoveryLayer
            .layer(Panicky)
            .oneshot(request("/fine"))
            .await
            .unwrap();
        assert!(response.headers().get("grpc-status").is_none());
    }

    #[tokio::test]
    async fn test_panic_while_streaming_ends_with_internal_trailers() {
        let response = RecoveryLayer
            .layer(Panicky)
            .oneshot(request("/stream"))
            .await
            .unwrap();
        assert!(response.headers().get("grpc-status").is_none());

        let mut body = response.into_body();
        let frame = next_frame(&mut body).await.unwrap().unwrap();
        let status = Status::from_header_map(frame.trailers_ref().unwrap()).unwrap();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(status.message(), INTERNAL_ERROR_MESSAGE);
        assert!(next_frame(&mut body).await.is_none());
    }

    #[tokio::test]
    async fn test_panicking_producer_ends_stream_with_internal() {
        let (tx, mut rx) = mpsc::channel::<Result<u32, Status>>(4);
        spawn_producer("/pkg.Svc/Watch", tx, |tx| async move {
            let _ = tx.send(Ok(1)).await;
            panic!("producer exploded");
        });

        assert_eq!(rx.recv().await.unwrap().unwrap(), 1);
        let status = rx.recv().await.unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_finished_producer_closes_stream() {
        let (tx, mut rx) = mpsc::channel::<Result<u32, Status>>(4);
        spawn_producer("/pkg.Svc/Watch", tx, |tx| async move {
            let _ = tx.send(Ok(7)).await;
        });

        assert_eq!(rx.recv().await.unwrap().unwrap(), 7);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
