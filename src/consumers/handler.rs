use crate::consumers::Message;

/// The prefetch count used by handlers that do not override [`Handler::prefetch`].
pub const DEFAULT_PREFETCH_COUNT: u16 = 50;

/// Implementers of the `Handler` trait process the messages delivered to a queue.
///
/// A handler describes *where* it consumes from ([`Handler::queue`]), *how much* it wants
/// in flight ([`Handler::prefetch`]) and *what* it does with each message
/// ([`Handler::on_message`]).
///
/// # Scope
///
/// `on_message` does not get access to the underlying RabbitMq channel.
/// Acknowledgement is automatic: every delivery is acked once `on_message` returns, whether it
/// succeeded or not. Failed messages are not redelivered by the framework, they are handed to the
/// registered [`ErrorHandler`]s, which are free to implement retries on their own.
///
/// The same handler instance processes every delivery of its queue, possibly from several tasks
/// at once: keep per-message state out of `self`.
///
/// [`ErrorHandler`]: crate::consumers::ErrorHandler
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    /// The queue this handler consumes from. It must already exist.
    fn queue(&self) -> &str;

    /// Maximum number of unacknowledged deliveries the broker pushes to this handler's channel.
    fn prefetch(&self) -> u16 {
        DEFAULT_PREFETCH_COUNT
    }

    /// Emit `start` and `done: <elapsed> ms` log lines around each delivery.
    fn is_log_time(&self) -> bool {
        false
    }

    /// Display name used in log lines. Defaults to the type name, without its module path.
    fn name(&self) -> &str {
        short_type_name::<Self>()
    }

    async fn on_message(&self, message: &Message) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl<H> Handler for Box<H>
where
    H: Handler + ?Sized,
{
    fn queue(&self) -> &str {
        H::queue(self)
    }

    fn prefetch(&self) -> u16 {
        H::prefetch(self)
    }

    fn is_log_time(&self) -> bool {
        H::is_log_time(self)
    }

    fn name(&self) -> &str {
        H::name(self)
    }

    async fn on_message(&self, message: &Message) -> Result<(), anyhow::Error> {
        H::on_message(self, message).await
    }
}

pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let path = full.split('<').next().unwrap_or(full);
    path.rsplit("::").next().unwrap_or(path)
}
