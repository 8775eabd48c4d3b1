use crate::amqp::{ConsumerChannel, DeliveryStream};
use crate::consumers::{ConsumptionPipeline, ErrorHandlers, Handler, RegistrationError};
use futures_util::{Future, FutureExt, StreamExt};
use std::sync::Arc;
use uuid::Uuid;

/// A consumer registered on a queue, bound to a single [`Handler`].
///
/// Deliveries are processed one at a time, in the order the broker pushed them: the next delivery
/// is pulled from the channel only once the previous one has been acknowledged.
/// Run several consumers (see [`ConsumerGroup`](crate::consumers::ConsumerGroup)) to process
/// several queues concurrently.
pub struct SimpleConsumer {
    channel: Arc<dyn ConsumerChannel>,
    pipeline: ConsumptionPipeline,
    consumer_tag: String,
    deliveries: DeliveryStream,
}

impl SimpleConsumer {
    /// Register `handler` as a consumer on `channel`.
    ///
    /// In order:
    /// - the channel prefetch count is set to [`Handler::prefetch`];
    /// - a consumer is registered on [`Handler::queue`], with manual acknowledgements;
    /// - the existence of the queue is asserted, without creating it.
    ///
    /// If the queue assertion fails the consumer is cancelled before returning the error.
    #[tracing::instrument(
        skip_all,
        name = "consumer_register",
        fields(queue = %handler.queue(), consumer = %handler.name())
    )]
    pub async fn consume(
        channel: Arc<dyn ConsumerChannel>,
        handler: Arc<dyn Handler>,
        error_handlers: Arc<ErrorHandlers>,
    ) -> Result<Self, RegistrationError> {
        let queue = handler.queue().to_owned();

        channel
            .basic_qos(handler.prefetch())
            .await
            .map_err(|source| RegistrationError::Qos {
                queue: queue.clone(),
                source,
            })?;

        let consumer_tag = Uuid::new_v4().to_string();
        let deliveries = channel
            .basic_consume(&queue, &consumer_tag)
            .await
            .map_err(|source| RegistrationError::Consume {
                queue: queue.clone(),
                source,
            })?;

        if let Err(source) = channel.queue_declare_passive(&queue).await {
            if let Err(e) = channel.basic_cancel(&consumer_tag).await {
                tracing::warn!(error = %e, "Failed to cancel the consumer of a missing queue.");
            }
            return Err(RegistrationError::QueueAssertion { queue, source });
        }

        tracing::info!(consumer_tag = %consumer_tag, "Consumer registered.");
        Ok(Self {
            pipeline: ConsumptionPipeline::new(handler, Arc::clone(&channel), error_handlers),
            channel,
            consumer_tag,
            deliveries,
        })
    }

    /// The tag the broker knows this consumer by.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn handler(&self) -> &dyn Handler {
        self.pipeline.handler()
    }

    /// Process deliveries until `shutdown` resolves or the broker stops pushing them.
    ///
    /// `run_until_shutdown` fails if the delivery stream fails (e.g. the connection with RabbitMq
    /// is lost). Either way, the consumer is cancelled and its channel closed before returning.
    #[tracing::instrument(
        skip_all,
        name = "consumer_run",
        fields(queue = %self.pipeline.handler().queue())
    )]
    pub async fn run_until_shutdown(
        mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), anyhow::Error> {
        let shutdown = shutdown.fuse();
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                // Shutdown takes precedence over deliveries already buffered on the channel.
                biased;

                _ = &mut shutdown => {
                    tracing::info!("Consumer received shutdown event.");
                    break Ok(());
                }

                delivery = self.deliveries.next() => {
                    match delivery {
                        None => break Ok(()),
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "Consumer error.");
                            break Err(e);
                        }
                        Some(Ok(delivery)) => {
                            self.pipeline.on_delivery(&self.consumer_tag, delivery).await;
                        }
                    }
                }
            }
        };

        self.close().await;
        result
    }

    /// Cancel the consumer and close its channel. Failures are logged, never returned.
    pub async fn close(self) {
        if let Err(e) = self.channel.basic_cancel(&self.consumer_tag).await {
            tracing::warn!(error = %e, consumer_tag = %self.consumer_tag, "Failed to cancel consumer.");
        }
        if let Err(e) = self.channel.close().await {
            tracing::warn!(error = %e, consumer_tag = %self.consumer_tag, "Failed to close channel.");
        }
    }
}

impl std::fmt::Debug for SimpleConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleConsumer")
            .field("queue", &self.pipeline.handler().queue())
            .field("consumer_tag", &self.consumer_tag)
            .finish()
    }
}
