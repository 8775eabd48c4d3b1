//! Facilities to consume messages from a RabbitMq queue. Check out [`ConsumerGroup`] as a
//! starting point, or [`SimpleConsumer`] to drive a single consumer yourself.
pub use builders::{ConsumerGroup, ConsumerGroupBuilder};
pub use consumer::SimpleConsumer;
pub use context::{get_message_local_item, set_message_local_item, ConsumeContext};
pub use convert::DecodingError;
pub use error::{HandlerError, RegistrationError};
pub use error_handler::{ErrorHandler, ErrorHandlers};
pub use handler::{Handler, DEFAULT_PREFETCH_COUNT};
pub use message::{HeaderValue, Message, MessageProperties};
pub use pipeline::ConsumptionPipeline;

mod builders;
mod consumer;
mod context;
pub mod convert;
mod error;
mod error_handler;
mod handler;
mod message;
mod pipeline;
