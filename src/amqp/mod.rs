//! Broker plumbing: connection settings, connections and the channel operations consumers use.

mod channel;
pub mod configuration;
mod factory;

pub use channel::{
    ChannelFactory, ConsumerChannel, DedicatedChannel, Delivery, DeliveryStream, Envelope,
};
pub use factory::ConnectionFactory;

pub use lapin::{types, BasicProperties};
