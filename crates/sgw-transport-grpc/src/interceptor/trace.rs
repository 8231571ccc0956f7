//! Per-call tracing span.

use super::{CallContext, CallInterceptor, CallOutcome};
use tonic::{Code, Status};

/// Opens an `rpc` span for each call and logs its completion.
pub struct TracingInterceptor;

impl CallInterceptor for TracingInterceptor {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn on_request(&self, ctx: &mut CallContext) -> Result<(), Status> {
        ctx.span = tracing::info_span!(
            "rpc",
            plane = %ctx.plane,
            method = %ctx.path,
            kind = ctx.kind.as_str(),
            code = tracing::field::Empty,
        );
        Ok(())
    }

    fn on_response(&self, ctx: &CallContext, outcome: &CallOutcome) {
        ctx.span.record("code", tracing::field::debug(outcome.code));
        let elapsed_ms = ctx.started.elapsed().as_secs_f64() * 1000.0;

        let _entered = ctx.span.enter();
        match outcome.code {
            Code::Ok => tracing::debug!(elapsed_ms, "RPC completed"),
            Code::Internal | Code::Unknown | Code::DataLoss => {
                tracing::warn!(elapsed_ms, code = ?outcome.code, "RPC failed")
            }
            code => tracing::debug!(elapsed_ms, ?code, "RPC returned error"),
        }
    }
}
