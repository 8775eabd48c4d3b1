use crate::amqp::{ConsumerChannel, Delivery};
use crate::consumers::context::EndOnDrop;
use crate::consumers::{
    convert, ConsumeContext, ErrorHandlers, Handler, HandlerError, Message, MessageProperties,
};
use amq_protocol_types::DeliveryTag;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Owns the lifecycle of every delivery pushed to a consumer: normalisation, handler invocation,
/// error handlers, acknowledgement.
///
/// The pipeline never fails. Whatever happens while processing a delivery is contained, logged
/// and followed by an acknowledgement (if the channel is still open), so that the consumer can
/// move on to the next delivery.
pub struct ConsumptionPipeline {
    handler: Arc<dyn Handler>,
    channel: Arc<dyn ConsumerChannel>,
    error_handlers: Arc<ErrorHandlers>,
}

impl ConsumptionPipeline {
    pub fn new(
        handler: Arc<dyn Handler>,
        channel: Arc<dyn ConsumerChannel>,
        error_handlers: Arc<ErrorHandlers>,
    ) -> Self {
        Self {
            handler,
            channel,
            error_handlers,
        }
    }

    pub fn handler(&self) -> &dyn Handler {
        self.handler.as_ref()
    }

    /// Process a delivery pushed to the consumer registered as `consumer_tag`.
    #[tracing::instrument(
        name = "process_message",
        skip_all,
        fields(queue = %self.handler.queue(), delivery_tag = delivery.envelope.delivery_tag),
        level = tracing::Level::DEBUG
    )]
    pub async fn on_delivery(&self, consumer_tag: &str, delivery: Delivery) {
        let Delivery {
            envelope,
            properties,
            body,
        } = delivery;
        let (properties, decoded) = match convert::to_message_properties(&properties, &envelope) {
            Ok(properties) => (properties, Ok(())),
            Err(e) => (convert::from_envelope(&envelope), Err(HandlerError::from(e))),
        };
        let message = Message::new(
            body,
            MessageProperties {
                consumer_tag: consumer_tag.to_owned(),
                consumer_queue: self.handler.queue().to_owned(),
                ..properties
            },
        );
        self.process(message, envelope.delivery_tag, decoded).await
    }

    async fn process(
        &self,
        message: Message,
        delivery_tag: DeliveryTag,
        decoded: Result<(), HandlerError>,
    ) {
        let context = ConsumeContext::start(self.handler.as_ref(), delivery_tag);
        let guard = EndOnDrop(Arc::clone(&context));

        Arc::clone(&context)
            .scope(async {
                let log_time = self.handler.is_log_time();
                if log_time {
                    context.info("start");
                }

                let outcome = match decoded {
                    Ok(()) => self.invoke(&message).await,
                    Err(e) => Err(e),
                };

                if let Err(error) = &outcome {
                    self.error_handlers
                        .handle_failure(&context, self.handler.as_ref(), &message, error)
                        .await;
                    context.warn(format!("{} consumer error", self.handler.name()), error);
                }

                self.acknowledge(&context, delivery_tag).await;

                if log_time {
                    context.info(format!("done: {} ms", context.elapsed()));
                }
            })
            .await;

        context.end();
        drop(guard);
    }

    /// Invoke the handler, turning a panic into a [`HandlerError::Panic`].
    async fn invoke(&self, message: &Message) -> Result<(), HandlerError> {
        match AssertUnwindSafe(self.handler.on_message(message))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome.map_err(HandlerError::from),
            Err(panic) => Err(HandlerError::from_panic(panic)),
        }
    }

    /// Ack the delivery, unless the channel is already closing: the consumer is shutting down and
    /// the broker will redeliver the message anyway.
    async fn acknowledge(&self, context: &ConsumeContext, delivery_tag: DeliveryTag) {
        if !self.channel.is_open() {
            tracing::debug!(delivery_tag, "Channel closed, skipping ack.");
            return;
        }
        if let Err(e) = self.channel.basic_ack(delivery_tag).await {
            context.error("ack error", &*e);
        }
    }
}
