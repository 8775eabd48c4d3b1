use crate::consumers::handler::short_type_name;
use crate::consumers::{ConsumeContext, Handler, HandlerError, Message};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

/// An observer invoked when a [`Handler`] fails to process a message.
///
/// # Use case
///
/// The framework acknowledges every delivery, failed or not: a message that could not be processed
/// is gone from the queue once the handler returns. Error handlers are the extension point to do
/// something about it - report the failure, park the message somewhere, republish it for a
/// delayed retry, etc.
///
/// # Isolation
///
/// Error handlers run in registration order. An error handler that fails (or panics) is logged
/// and skipped: the remaining error handlers still run, and the delivery is still acknowledged.
#[async_trait::async_trait]
pub trait ErrorHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        handler: &dyn Handler,
        message: &Message,
        error: &HandlerError,
    ) -> Result<(), anyhow::Error>;

    /// Identity of the error handler in log lines. Defaults to the type name.
    fn name(&self) -> &str {
        short_type_name::<Self>()
    }
}

/// assert it's object safe
type _CHECK = Box<dyn ErrorHandler>;

/// The ordered chain of [`ErrorHandler`]s shared by the consumers of a process.
///
/// Error handlers are expected to be registered while setting up consumers. Registering later
/// is allowed: deliveries already being processed keep using the chain as it was when their
/// handler failed.
#[derive(Default)]
pub struct ErrorHandlers {
    chain: RwLock<Vec<Arc<dyn ErrorHandler>>>,
}

impl ErrorHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an error handler. It runs after every error handler registered before it.
    pub fn register<E: ErrorHandler>(&self, error_handler: E) {
        self.register_dyn(Arc::new(error_handler))
    }

    pub fn register_dyn(&self, error_handler: Arc<dyn ErrorHandler>) {
        self.chain
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error_handler);
    }

    pub fn len(&self) -> usize {
        self.chain
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every registered error handler against a failed delivery.
    ///
    /// Never fails: failures of individual error handlers are logged through `context`.
    pub async fn handle_failure(
        &self,
        context: &ConsumeContext,
        handler: &dyn Handler,
        message: &Message,
        error: &HandlerError,
    ) {
        // The lock is not held across `.await`.
        for error_handler in self.snapshot() {
            let outcome = AssertUnwindSafe(error_handler.handle(handler, message, error))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(HandlerError::from_panic(panic).into()));
            if let Err(e) = outcome {
                context.error(format!("error handler {} error", error_handler.name()), &*e);
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn ErrorHandler>> {
        self.chain
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for ErrorHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.snapshot().iter().map(|e| e.name().to_owned()))
            .finish()
    }
}
