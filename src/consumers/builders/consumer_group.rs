use futures_util::{stream::FuturesUnordered, StreamExt};
use shutdown_handler::ShutdownHandler;

use crate::{
    amqp::ChannelFactory,
    consumers::{ErrorHandler, ErrorHandlers, Handler, SimpleConsumer},
};
use std::sync::Arc;

/// A collection of RabbitMq consumers sharing the same channel factory and error handlers.
///
/// `ConsumerGroup` is the main entrypoint if you want to pull and process messages from queues.
/// Each consumer gets a dedicated channel from the [`ChannelFactory`] and runs on its own task:
/// consumers in the same group process their queues concurrently.
///
/// # How do I build a `ConsumerGroup`?
///
/// The starting point is [`ConsumerGroup::builder`]. Register error handlers and handlers on the
/// returned [`ConsumerGroupBuilder`], then call [`ConsumerGroupBuilder::build`].
#[derive(Debug)]
pub struct ConsumerGroup {
    consumers: Vec<SimpleConsumer>,
    error_handlers: Arc<ErrorHandlers>,
}

impl ConsumerGroup {
    /// Start building a [`ConsumerGroup`].
    pub fn builder(channel_factory: impl ChannelFactory) -> ConsumerGroupBuilder {
        ConsumerGroupBuilder {
            channel_factory: Box::new(channel_factory),
            error_handlers: Arc::new(ErrorHandlers::new()),
            handlers: Vec::new(),
        }
    }

    pub fn consumers(&self) -> &[SimpleConsumer] {
        &self.consumers
    }

    /// The error handlers shared by every consumer in the group.
    ///
    /// Error handlers registered here after the group has been built are picked up by the
    /// next failure.
    pub fn error_handlers(&self) -> &Arc<ErrorHandlers> {
        &self.error_handlers
    }

    /// You can call `run_until_sigterm` to start consuming messages from the queues you bound.
    /// As the name implies, `run_until_sigterm` returns control to the caller only if:
    /// - one of the consumers stops (e.g. disconnection);
    /// - the application is stopped via SIGTERM.
    pub async fn run_until_sigterm(self) -> Result<(), anyhow::Error> {
        self.run_until_shutdown(ShutdownHandler::sigterm()?).await
    }

    /// You can call `run_until_shutdown` to start consuming messages from the queues you bound.
    /// As the name implies, `run_until_shutdown` returns control to the caller only if:
    /// - one of the consumers stops (e.g. disconnection);
    /// - the application is stopped via the shutdown handler.
    ///
    /// When a consumer stops, the others are shut down as well.
    #[tracing::instrument(skip_all, name = "consumer_group_run")]
    pub async fn run_until_shutdown(
        self,
        shutdown: Arc<ShutdownHandler>,
    ) -> Result<(), anyhow::Error> {
        let mut consumers = FuturesUnordered::from_iter(
            self.consumers
                .into_iter()
                .map(|c| {
                    let shutdown = Arc::clone(&shutdown);
                    c.run_until_shutdown(async move { shutdown.wait_for_signal().await })
                })
                .map(tokio::spawn),
        );

        // wait for all consumers to shutdown
        while let Some(res) = consumers.next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("Consumer failed: {:#}", e),
                Err(e) => tracing::error!("Consumer task failed: {}", e),
            }
            shutdown.shutdown();
        }
        Ok(())
    }
}

/// A builder to register handlers and error handlers for a [`ConsumerGroup`].
///
/// Use [`ConsumerGroup::builder`] as entrypoint.
pub struct ConsumerGroupBuilder {
    channel_factory: Box<dyn ChannelFactory>,
    error_handlers: Arc<ErrorHandlers>,
    handlers: Vec<Arc<dyn Handler>>,
}

impl ConsumerGroupBuilder {
    /// Append an error handler to the chain shared by every consumer of the group.
    ///
    /// Error handlers run in the order they are registered.
    #[must_use]
    pub fn with_error_handler<E: ErrorHandler>(self, error_handler: E) -> Self {
        self.error_handlers.register(error_handler);
        self
    }

    /// Share an existing chain of error handlers, replacing the one of the builder.
    #[must_use]
    pub fn with_error_handlers(mut self, error_handlers: Arc<ErrorHandlers>) -> Self {
        self.error_handlers = error_handlers;
        self
    }

    /// Add a consumer to the group, processing the queue returned by [`Handler::queue`].
    #[must_use]
    pub fn handler<H: Handler>(self, handler: H) -> Self {
        self.dyn_handler(Arc::new(handler))
    }

    #[must_use]
    pub fn dyn_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Register every handler against its queue.
    ///
    /// When you `.await` `build`, a channel is opened for each handler and its consumer is
    /// registered. If any registration fails, the consumers registered so far are closed and
    /// the error is returned.
    ///
    /// `build` does NOT trigger the processing of messages!
    /// Check out [`ConsumerGroup::run_until_sigterm`].
    pub async fn build(self) -> Result<ConsumerGroup, anyhow::Error> {
        let Self {
            channel_factory,
            error_handlers,
            handlers,
        } = self;

        let mut consumers = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let registered = Self::register(channel_factory.as_ref(), handler, &error_handlers);
            match registered.await {
                Ok(consumer) => consumers.push(consumer),
                Err(e) => {
                    for consumer in consumers {
                        consumer.close().await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(ConsumerGroup {
            consumers,
            error_handlers,
        })
    }

    /// Open a channel for `handler` and register its consumer. The channel is closed if the
    /// registration fails.
    async fn register(
        channel_factory: &dyn ChannelFactory,
        handler: Arc<dyn Handler>,
        error_handlers: &Arc<ErrorHandlers>,
    ) -> Result<SimpleConsumer, anyhow::Error> {
        let channel = channel_factory.create_channel().await?;
        match SimpleConsumer::consume(Arc::clone(&channel), handler, Arc::clone(error_handlers))
            .await
        {
            Ok(consumer) => Ok(consumer),
            Err(e) => {
                if let Err(close_error) = channel.close().await {
                    tracing::warn!(error = %close_error, "Failed to close channel.");
                }
                Err(e.into())
            }
        }
    }
}
