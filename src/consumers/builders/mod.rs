mod consumer_group;

pub use consumer_group::{ConsumerGroup, ConsumerGroupBuilder};
