use crate::consumers::convert::DecodingError;

/// Why the processing of a delivery failed.
///
/// This is what [`ErrorHandler`](crate::consumers::ErrorHandler)s observe. Whatever the variant,
/// the failure never leaves the pipeline: it is logged and the delivery is acknowledged.
#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    /// The handler returned an error.
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
    /// The handler panicked. The panic payload, if it was a string, is kept for diagnostics.
    #[error("The message handler panicked: {0}")]
    Panic(String),
    /// The delivery could not be turned into a [`Message`](crate::consumers::Message): the
    /// handler was never invoked.
    #[error("Failed to decode the incoming delivery.")]
    Decoding(#[from] DecodingError),
}

impl HandlerError {
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_owned()
        };
        Self::Panic(message)
    }
}

/// A consumer could not be registered against its queue.
///
/// Registration is all-or-nothing: when this error is returned no consumer is left
/// registered on the broker for that queue.
#[derive(thiserror::Error, Debug)]
pub enum RegistrationError {
    #[error("Failed to set the prefetch count for queue `{queue}`.")]
    Qos {
        queue: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to register a consumer on queue `{queue}`.")]
    Consume {
        queue: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Queue `{queue}` does not exist or cannot be accessed.")]
    QueueAssertion {
        queue: String,
        #[source]
        source: anyhow::Error,
    },
}

impl RegistrationError {
    pub fn queue(&self) -> &str {
        match self {
            Self::Qos { queue, .. }
            | Self::Consume { queue, .. }
            | Self::QueueAssertion { queue, .. } => queue,
        }
    }
}
