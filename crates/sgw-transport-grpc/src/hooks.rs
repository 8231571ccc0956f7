//! Fault-injection hooks.
//!
//! Test clients create a named hooks context, register hooks against full
//! method paths, then tag requests with the `x-hooks-id` metadata key. The
//! [`HooksInterceptor`] consults the context for every tagged call and can
//! fail it with a configured status before the handler runs.

use crate::interceptor::{CallContext, CallInterceptor};
use crate::proto::hooks::{
    hook, hooks_server::Hooks, AddHooksRequest, AddHooksResponse, CreateHooksContextRequest,
    CreateHooksContextResponse, DestroyHooksContextRequest, DestroyHooksContextResponse, Hook,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tonic::{Code, Request, Response, Status};

/// Request metadata key naming the hooks context.
pub const HOOKS_ID_METADATA_KEY: &str = "x-hooks-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    ReturnError { code: Code, message: String },
    Passthrough,
}

#[derive(Debug, Clone)]
struct RegisteredHook {
    name: String,
    target_method: String,
    action: HookAction,
    /// Remaining invocations; `None` is unlimited.
    remaining: Option<u32>,
}

/// Registry of hooks contexts.
#[derive(Debug, Default)]
pub struct HooksManager {
    contexts: Mutex<HashMap<String, Vec<RegisteredHook>>>,
}

impl HooksManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_context(&self, id: &str) -> Result<(), Status> {
        if id.is_empty() {
            return Err(Status::invalid_argument("hooks context id cannot be empty"));
        }
        let mut contexts = self.contexts.lock();
        if contexts.contains_key(id) {
            return Err(Status::already_exists(format!("hooks context {} already exists", id)));
        }
        contexts.insert(id.to_string(), Vec::new());
        tracing::debug!(hooks_id = id, "Created hooks context");
        Ok(())
    }

    pub fn destroy_context(&self, id: &str) -> Result<(), Status> {
        match self.contexts.lock().remove(id) {
            Some(_) => {
                tracing::debug!(hooks_id = id, "Destroyed hooks context");
                Ok(())
            }
            None => Err(Status::not_found(format!("hooks context {} not found", id))),
        }
    }

    /// Append `hooks` to context `id`. Nothing is added if any hook is invalid.
    pub fn add_hooks(&self, id: &str, hooks: Vec<Hook>) -> Result<(), Status> {
        let parsed = hooks
            .into_iter()
            .map(parse_hook)
            .collect::<Result<Vec<_>, Status>>()?;

        let mut contexts = self.contexts.lock();
        let context = contexts
            .get_mut(id)
            .ok_or_else(|| Status::not_found(format!("hooks context {} not found", id)))?;
        context.extend(parsed);
        Ok(())
    }

    /// Run the first live hook matching `method` in context `id`.
    ///
    /// Returns the status to fail the call with, if any. Unknown contexts
    /// let the call through.
    pub fn dispatch(&self, id: &str, method: &str) -> Option<Status> {
        let mut contexts = self.contexts.lock();
        let Some(context) = contexts.get_mut(id) else {
            tracing::warn!(hooks_id = id, method, "Request names an unknown hooks context");
            return None;
        };

        let hook = context
            .iter_mut()
            .find(|h| h.target_method == method && h.remaining != Some(0))?;
        if let Some(remaining) = hook.remaining.as_mut() {
            *remaining -= 1;
        }

        tracing::debug!(hooks_id = id, hook = %hook.name, method, "Hook fired");
        match &hook.action {
            HookAction::ReturnError { code, message } => Some(Status::new(*code, message.clone())),
            HookAction::Passthrough => None,
        }
    }
}

fn parse_hook(hook: Hook) -> Result<RegisteredHook, Status> {
    if hook.target_method.is_empty() {
        return Err(Status::invalid_argument(format!(
            "hook {} has no target_method",
            hook.name
        )));
    }
    let action = match hook.action {
        Some(hook::Action::ReturnError(err)) => {
            let code = Code::from_i32(err.code);
            if code == Code::Ok {
                return Err(Status::invalid_argument(format!(
                    "hook {} returns an error with code OK",
                    hook.name
                )));
            }
            HookAction::ReturnError {
                code,
                message: err.message,
            }
        }
        Some(hook::Action::Passthrough(_)) => HookAction::Passthrough,
        None => {
            return Err(Status::invalid_argument(format!("hook {} has no action", hook.name)));
        }
    };
    Ok(RegisteredHook {
        name: hook.name,
        target_method: hook.target_method,
        action,
        remaining: hook.max_invocations,
    })
}

/// gRPC front end for [`HooksManager`].
pub struct HooksService {
    manager: Arc<HooksManager>,
}

impl HooksService {
    pub fn new(manager: Arc<HooksManager>) -> Self {
        Self { manager }
    }
}

#[tonic::async_trait]
impl Hooks for HooksService {
    async fn create_hooks_context(
        &self,
        request: Request<CreateHooksContextRequest>,
    ) -> Result<Response<CreateHooksContextResponse>, Status> {
        self.manager.create_context(&request.into_inner().id)?;
        Ok(Response::new(CreateHooksContextResponse {}))
    }

    async fn destroy_hooks_context(
        &self,
        request: Request<DestroyHooksContextRequest>,
    ) -> Result<Response<DestroyHooksContextResponse>, Status> {
        self.manager.destroy_context(&request.into_inner().id)?;
        Ok(Response::new(DestroyHooksContextResponse {}))
    }

    async fn add_hooks(
        &self,
        request: Request<AddHooksRequest>,
    ) -> Result<Response<AddHooksResponse>, Status> {
        let req = request.into_inner();
        self.manager.add_hooks(&req.hooks_context_id, req.hooks)?;
        Ok(Response::new(AddHooksResponse {}))
    }
}

/// Chain link that applies hooks to tagged calls.
pub struct HooksInterceptor {
    manager: Arc<HooksManager>,
}

impl HooksInterceptor {
    pub fn new(manager: Arc<HooksManager>) -> Self {
        Self { manager }
    }
}

impl CallInterceptor for HooksInterceptor {
    fn name(&self) -> &'static str {
        "hooks"
    }

    fn on_request(&self, ctx: &mut CallContext) -> Result<(), Status> {
        let Some(id) = ctx
            .headers
            .get(HOOKS_ID_METADATA_KEY)
            .and_then(|v| v.to_str().ok())
        else {
            return Ok(());
        };
        match self.manager.dispatch(id, &ctx.path) {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }
}
