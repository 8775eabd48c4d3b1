use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

/// A delivery after normalisation, as seen by [`Handler`](crate::consumers::Handler)s and
/// [`ErrorHandler`](crate::consumers::ErrorHandler)s.
///
/// A `Message` is built once per delivery and never mutated afterwards: handlers only get
/// shared references to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    body: Vec<u8>,
    properties: MessageProperties,
}

impl Message {
    pub fn new(body: Vec<u8>, properties: MessageProperties) -> Self {
        Self { body, properties }
    }

    /// The raw payload, exactly as received.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    /// The payload decoded as UTF-8.
    pub fn body_as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }

    /// Deserialize a JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// AMQP basic properties and envelope data of a delivery, plus the consumer it was routed to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: BTreeMap<String, HeaderValue>,
    /// `2` for persistent messages, `1` (or absent) for transient ones.
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch, as set by the publisher.
    pub timestamp: Option<u64>,
    /// The AMQP `type` property.
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,

    pub delivery_tag: u64,
    pub redelivered: bool,
    pub received_exchange: String,
    pub received_routing_key: String,

    /// The tag of the consumer the broker pushed the delivery to.
    pub consumer_tag: String,
    /// The queue the consumer is bound to.
    pub consumer_queue: String,
}

impl MessageProperties {
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    /// Lookup a header string value. `None` if missing or not a string.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        match self.header(name)? {
            HeaderValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// A header value, decoded from its AMQP field representation.
///
/// All integer widths collapse into [`HeaderValue::Int`] (or [`HeaderValue::UInt`] for the
/// unsigned 32-bit kind), both float widths into [`HeaderValue::Float`].
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Decimal { scale: u8, value: u32 },
    String(String),
    Bytes(Vec<u8>),
    Timestamp(u64),
    List(Vec<HeaderValue>),
    Table(BTreeMap<String, HeaderValue>),
    Void,
}
