//! Verbose request logging, enabled by the `debug` option.

use super::{CallContext, CallInterceptor, CallOutcome};
use tonic::Status;

pub struct DebugInterceptor;

impl CallInterceptor for DebugInterceptor {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn on_request(&self, ctx: &mut CallContext) -> Result<(), Status> {
        let metadata: Vec<&str> = ctx
            .headers
            .keys()
            .map(|k| k.as_str())
            .filter(|k| !k.starts_with(':'))
            .collect();
        tracing::info!(
            plane = %ctx.plane,
            method = %ctx.path,
            kind = ctx.kind.as_str(),
            ?metadata,
            "Incoming request"
        );
        Ok(())
    }

    fn on_response(&self, ctx: &CallContext, outcome: &CallOutcome) {
        tracing::info!(
            plane = %ctx.plane,
            method = %ctx.path,
            code = ?outcome.code,
            short_circuited_by = ?outcome.short_circuited_by,
            elapsed_us = ctx.started.elapsed().as_micros() as u64,
            "Request finished"
        );
    }
}
