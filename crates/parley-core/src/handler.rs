//! Per-message-type request handler registry.
//!
//! One handler per message type; re-registering replaces. Handlers are async
//! closures returning either a value or an [`ErrorBody`] — the engine turns
//! the latter into an `{ok: false}` response and keeps serving.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorBody;

/// Context handed to a handler alongside the request payload.
#[derive(Clone, Debug)]
pub struct RequestMeta {
    /// The request frame's id (equals the response's correlation id).
    pub id: Uuid,
    pub message_type: String,
    /// Normalized source origin of the request.
    pub origin: String,
    /// Sender's clock at stamp time, ms.
    pub timestamp: u64,
}

pub type HandlerResult = Result<Value, ErrorBody>;

/// Optional schemas attached at registration.
#[derive(Clone, Debug, Default)]
pub struct HandlerSchemas {
    pub request: Option<Value>,
    pub response: Option<Value>,
}

pub(crate) trait ErasedHandler: Send + Sync {
    fn call(&self, payload: Value, meta: RequestMeta) -> BoxFuture<'static, HandlerResult>;
}

struct FnHandler<F>(F);

impl<F, Fut> ErasedHandler for FnHandler<F>
where
    F: Fn(Value, RequestMeta) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, payload: Value, meta: RequestMeta) -> BoxFuture<'static, HandlerResult> {
        (self.0)(payload, meta).boxed()
    }
}

struct RegisteredHandler {
    handler: Arc<dyn ErasedHandler>,
    schemas: HandlerSchemas,
}

/// Everything the engine needs to serve one request, cloned out of the
/// registry so the lock is not held across the handler's await.
pub(crate) struct PreparedHandler {
    pub handler: Arc<dyn ErasedHandler>,
    pub request_schema: Option<Value>,
    pub response_schema: Option<Value>,
}

#[derive(Default)]
pub struct HandlerRegistry {
    entries: RwLock<HashMap<String, RegisteredHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register<F, Fut>(
        &self,
        message_type: String,
        schemas: HandlerSchemas,
        handler: F,
    ) where
        F: Fn(Value, RequestMeta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.entries.write().insert(
            message_type,
            RegisteredHandler {
                handler: Arc::new(FnHandler(handler)),
                schemas,
            },
        );
    }

    pub(crate) fn remove(&self, message_type: &str) -> bool {
        self.entries.write().remove(message_type).is_some()
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.entries.read().contains_key(message_type)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub(crate) fn prepare(&self, message_type: &str) -> Option<PreparedHandler> {
        let entries = self.entries.read();
        let entry = entries.get(message_type)?;
        Some(PreparedHandler {
            handler: Arc::clone(&entry.handler),
            request_schema: entry.schemas.request.clone(),
            response_schema: entry.schemas.response.clone(),
        })
    }
}
