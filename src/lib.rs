//! `hutch` is a RabbitMQ consumption runtime, built on top of [`lapin`].
//!
//! Implement [`Handler`](crate::consumers::Handler) for each queue you want to consume from,
//! register the handlers on a [`ConsumerGroup`](crate::consumers::ConsumerGroup) and run it.
//! The runtime takes care of the rest:
//! - every delivery is normalised into a [`Message`](crate::consumers::Message);
//! - every delivery is acknowledged once its handler returns, whether it succeeded or not;
//! - failures are handed to the registered [`ErrorHandler`](crate::consumers::ErrorHandler)s.

pub mod amqp;
pub mod consumers;
