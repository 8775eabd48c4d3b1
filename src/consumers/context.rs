//! The per-delivery execution context.
//!
//! A [`ConsumeContext`] is created when the processing of a delivery begins and ended once the
//! delivery has been acknowledged. It carries the identity of the delivery (handler, queue,
//! delivery tag), a timer and a type-map of message-local items.
//!
//! The context of the delivery being processed is stored in task-local storage: handlers and
//! error handlers can reach it through [`ConsumeContext::current`] without it being threaded
//! through their signatures.
//!
//! # Common use cases
//!
//! ## Enriching failure reports
//!
//! A handler records what it was doing with [`set_message_local_item`]; an
//! [`ErrorHandler`](crate::consumers::ErrorHandler) retrieves it with
//! [`get_message_local_item`] when reporting the failure.
#![allow(clippy::declare_interior_mutable_const)] // silence tokio::task_local warning

use crate::consumers::Handler;
use amq_protocol_types::DeliveryTag;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use task_local_extensions::Extensions;
use tracing::Level;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: Arc<ConsumeContext>;
}

/// Identity, timer and scoped state of the delivery being processed.
///
/// Never shared between deliveries: each delivery gets a fresh context with a fresh
/// [`id`](ConsumeContext::id).
pub struct ConsumeContext {
    id: Uuid,
    consumer: String,
    queue: String,
    delivery_tag: DeliveryTag,
    started_at: Instant,
    /// `None` once the context has ended.
    extensions: Mutex<Option<Extensions>>,
}

impl fmt::Debug for ConsumeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeContext")
            .field("id", &self.id)
            .field("consumer", &self.consumer)
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery_tag)
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl ConsumeContext {
    /// Start the context of a delivery. The timer starts now.
    pub(crate) fn start(handler: &dyn Handler, delivery_tag: DeliveryTag) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            consumer: handler.name().to_owned(),
            queue: handler.queue().to_owned(),
            delivery_tag,
            started_at: Instant::now(),
            extensions: Mutex::new(Some(Extensions::new())),
        })
    }

    /// The context of the delivery processed by the current task, if any.
    pub fn current() -> Option<Arc<ConsumeContext>> {
        CURRENT.try_with(Arc::clone).ok()
    }

    /// Run `fut` with `self` as the current context.
    pub(crate) async fn scope<F: Future>(self: Arc<Self>, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Display name of the handler processing the delivery.
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery_tag
    }

    /// Milliseconds since the context was started.
    pub fn elapsed(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }

    /// Emit a log line tagged with the identity of the delivery.
    ///
    /// `error`, if provided, is rendered with its whole chain of sources.
    pub fn log(
        &self,
        level: Level,
        message: impl fmt::Display,
        error: Option<&(dyn std::error::Error + 'static)>,
    ) {
        let error = error.map(render_chain);
        let error = error.as_deref();

        macro_rules! emit {
            ($level:expr, $context:expr, $message:expr, $error:expr) => {
                tracing::event!(
                    $level,
                    consumer = %$context.consumer,
                    queue = %$context.queue,
                    delivery_tag = $context.delivery_tag,
                    error = $error,
                    "{}",
                    $message
                )
            };
        }

        match level {
            Level::ERROR => emit!(Level::ERROR, self, message, error),
            Level::WARN => emit!(Level::WARN, self, message, error),
            Level::INFO => emit!(Level::INFO, self, message, error),
            Level::DEBUG => emit!(Level::DEBUG, self, message, error),
            _ => emit!(Level::TRACE, self, message, error),
        }
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.log(Level::INFO, message, None)
    }

    pub fn warn(&self, message: impl fmt::Display, error: &(dyn std::error::Error + 'static)) {
        self.log(Level::WARN, message, Some(error))
    }

    pub fn error(&self, message: impl fmt::Display, error: &(dyn std::error::Error + 'static)) {
        self.log(Level::ERROR, message, Some(error))
    }

    /// End the context, dropping every message-local item.
    ///
    /// Calling `end` more than once is a no-op.
    pub fn end(&self) {
        let extensions = self.lock_extensions().take();
        drop(extensions);
    }

    pub fn is_ended(&self) -> bool {
        self.lock_extensions().is_none()
    }

    fn lock_extensions(&self) -> MutexGuard<'_, Option<Extensions>> {
        // Items are plain data: a panic while holding the lock cannot leave them half-updated.
        self.extensions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ends the wrapped context when dropped, whichever way the processing of a delivery exits.
pub(crate) struct EndOnDrop(pub(crate) Arc<ConsumeContext>);

impl Drop for EndOnDrop {
    fn drop(&mut self) {
        self.0.end();
    }
}

fn render_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

/// Retrieve an item from message-local storage based on its type.
///
/// It returns `None` outside of message processing, after the context ended, or if no item
/// of that type was stored.
pub fn get_message_local_item<T: Send + Sync + Clone + 'static>() -> Option<T> {
    CURRENT
        .try_with(|context| {
            context
                .lock_extensions()
                .as_ref()
                .and_then(|e| e.get::<T>().cloned())
        })
        .ok()
        .flatten()
}

/// Insert an item in message-local storage.
/// If another item with the same type was already stored in message-local storage it gets replaced.
pub fn set_message_local_item<T: Send + Sync + 'static>(item: T) {
    let stored = CURRENT.try_with(|context| {
        context
            .lock_extensions()
            .as_mut()
            .map(|e| e.insert(item))
            .is_some()
    });
    if !matches!(stored, Ok(true)) {
        tracing::warn!("Failed to set local item in the message context extensions.");
    }
}
