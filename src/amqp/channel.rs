//! The slice of the AMQP channel API a consumer relies on.
//!
//! Consumers never talk to [`lapin::Channel`] directly: they go through [`ConsumerChannel`],
//! which keeps the consumption pipeline independent of the wire client (and lets tests swap in
//! an in-memory broker).
use crate::amqp::ConnectionFactory;
use amq_protocol_types::{DeliveryTag, FieldTable, ShortString};
use futures_util::stream::{BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
        QueueDeclareOptions,
    },
    BasicProperties, ChannelState,
};
use std::sync::Arc;

/// The stream of deliveries pushed by the broker to a registered consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, anyhow::Error>>;

/// Routing and identity information attached by the broker to a delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Correlates the delivery with its acknowledgement. Unique per channel.
    pub delivery_tag: DeliveryTag,
    /// May be empty if the default exchange was used.
    pub exchange: ShortString,
    pub routing_key: ShortString,
    pub redelivered: bool,
}

/// A message as pushed by the broker, before any normalisation.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub envelope: Envelope,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            envelope: Envelope {
                delivery_tag: value.delivery_tag,
                exchange: value.exchange,
                routing_key: value.routing_key,
                redelivered: value.redelivered,
            },
            properties: value.properties,
            body: value.data,
        }
    }
}

/// Channel operations invoked while registering a consumer and while acknowledging deliveries.
#[async_trait::async_trait]
pub trait ConsumerChannel: Send + Sync + 'static {
    /// Cap the number of unacknowledged deliveries the broker pushes on this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), anyhow::Error>;

    /// Register a consumer on `queue` in manual acknowledgement mode.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, anyhow::Error>;

    /// Fail if `queue` does not exist. Never creates it.
    async fn queue_declare_passive(&self, queue: &str) -> Result<(), anyhow::Error>;

    /// Acknowledge a single delivery.
    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error>;

    /// `false` once the channel is closing or closed.
    fn is_open(&self) -> bool;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error>;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// assert it's object safe
type _CHECK = Box<dyn ConsumerChannel>;

#[async_trait::async_trait]
impl ConsumerChannel for lapin::Channel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), anyhow::Error> {
        lapin::Channel::basic_qos(self, prefetch_count, BasicQosOptions { global: false }).await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, anyhow::Error> {
        let options = BasicConsumeOptions {
            no_ack: false,
            ..BasicConsumeOptions::default()
        };
        let consumer = lapin::Channel::basic_consume(
            self,
            queue,
            consumer_tag,
            options,
            FieldTable::default(),
        )
        .await?;
        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(anyhow::Error::from))
            .boxed())
    }

    async fn queue_declare_passive(&self, queue: &str) -> Result<(), anyhow::Error> {
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        lapin::Channel::queue_declare(self, queue, options, FieldTable::default()).await?;
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error> {
        lapin::Channel::basic_ack(self, delivery_tag, BasicAckOptions { multiple: false }).await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        matches!(self.status().state(), ChannelState::Connected)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error> {
        lapin::Channel::basic_cancel(self, consumer_tag, BasicCancelOptions::default()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        lapin::Channel::close(self, 200, "OK").await?;
        Ok(())
    }
}

/// Types capable of handing out a dedicated channel to each consumer.
#[async_trait::async_trait]
pub trait ChannelFactory: Send + Sync + 'static {
    async fn create_channel(&self) -> Result<Arc<dyn ConsumerChannel>, anyhow::Error>;
}

/// A channel together with the connection dedicated to it.
///
/// Closing the channel closes the connection as well.
pub struct DedicatedChannel {
    connection: lapin::Connection,
    channel: lapin::Channel,
}

impl DedicatedChannel {
    pub fn new(connection: lapin::Connection, channel: lapin::Channel) -> Self {
        Self {
            connection,
            channel,
        }
    }
}

#[async_trait::async_trait]
impl ConsumerChannel for DedicatedChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), anyhow::Error> {
        ConsumerChannel::basic_qos(&self.channel, prefetch_count).await
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, anyhow::Error> {
        ConsumerChannel::basic_consume(&self.channel, queue, consumer_tag).await
    }

    async fn queue_declare_passive(&self, queue: &str) -> Result<(), anyhow::Error> {
        ConsumerChannel::queue_declare_passive(&self.channel, queue).await
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error> {
        ConsumerChannel::basic_ack(&self.channel, delivery_tag).await
    }

    fn is_open(&self) -> bool {
        ConsumerChannel::is_open(&self.channel)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error> {
        ConsumerChannel::basic_cancel(&self.channel, consumer_tag).await
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        let closed = ConsumerChannel::close(&self.channel).await;
        if self.connection.status().connected() {
            self.connection.close(200, "OK").await?;
        }
        closed
    }
}

/// Every channel gets its own connection to the broker.
#[async_trait::async_trait]
impl ChannelFactory for ConnectionFactory {
    async fn create_channel(&self) -> Result<Arc<dyn ConsumerChannel>, anyhow::Error> {
        let connection = self.new_connection().await?;
        let channel = connection.create_channel().await?;
        Ok(Arc::new(DedicatedChannel::new(connection, channel)))
    }
}
