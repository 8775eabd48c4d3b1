//! Translation of broker-native delivery metadata into [`MessageProperties`].
//!
//! Pure data mapping, no I/O. Textual fields are decoded as UTF-8: AMQP long strings are raw
//! bytes on the wire, and a value that is not valid UTF-8 is reported as a [`DecodingError`]
//! instead of being silently mangled.
use crate::amqp::{BasicProperties, Envelope};
use crate::consumers::message::{HeaderValue, MessageProperties};
use amq_protocol_types::{AMQPValue, FieldTable, ShortString};
use std::collections::BTreeMap;

/// A property of the delivery could not be decoded.
#[derive(thiserror::Error, Debug)]
pub enum DecodingError {
    #[error("Header `{header}` is not valid UTF-8.")]
    InvalidUtf8 {
        header: String,
        #[source]
        source: std::str::Utf8Error,
    },
}

/// Map the AMQP properties and envelope of a delivery.
///
/// Consumer tag and consumer queue are left empty: they are not part of the wire format and are
/// filled in by the pipeline the delivery was routed to.
pub fn to_message_properties(
    properties: &BasicProperties,
    envelope: &Envelope,
) -> Result<MessageProperties, DecodingError> {
    let headers = match properties.headers() {
        Some(table) => decode_table(table, None)?,
        None => BTreeMap::new(),
    };
    Ok(MessageProperties {
        content_type: string(properties.content_type()),
        content_encoding: string(properties.content_encoding()),
        headers,
        delivery_mode: *properties.delivery_mode(),
        priority: *properties.priority(),
        correlation_id: string(properties.correlation_id()),
        reply_to: string(properties.reply_to()),
        expiration: string(properties.expiration()),
        message_id: string(properties.message_id()),
        timestamp: *properties.timestamp(),
        kind: string(properties.kind()),
        user_id: string(properties.user_id()),
        app_id: string(properties.app_id()),
        cluster_id: string(properties.cluster_id()),
        ..from_envelope(envelope)
    })
}

/// The properties that can always be recovered from a delivery, whatever its headers contain.
pub fn from_envelope(envelope: &Envelope) -> MessageProperties {
    MessageProperties {
        delivery_tag: envelope.delivery_tag,
        redelivered: envelope.redelivered,
        received_exchange: envelope.exchange.as_str().to_owned(),
        received_routing_key: envelope.routing_key.as_str().to_owned(),
        ..MessageProperties::default()
    }
}

fn string(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|s| s.as_str().to_owned())
}

fn decode_table(
    table: &FieldTable,
    parent: Option<&str>,
) -> Result<BTreeMap<String, HeaderValue>, DecodingError> {
    table
        .inner()
        .iter()
        .map(|(key, value)| {
            let key = key.as_str();
            let path = match parent {
                Some(parent) => format!("{parent}.{key}"),
                None => key.to_owned(),
            };
            let value = decode_value(&path, value)?;
            Ok((key.to_owned(), value))
        })
        .collect()
}

fn decode_value(path: &str, value: &AMQPValue) -> Result<HeaderValue, DecodingError> {
    let decoded = match value {
        AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
        AMQPValue::ShortShortInt(i) => HeaderValue::Int((*i).into()),
        AMQPValue::ShortShortUInt(i) => HeaderValue::Int((*i).into()),
        AMQPValue::ShortInt(i) => HeaderValue::Int((*i).into()),
        AMQPValue::ShortUInt(i) => HeaderValue::Int((*i).into()),
        AMQPValue::LongInt(i) => HeaderValue::Int((*i).into()),
        AMQPValue::LongUInt(i) => HeaderValue::UInt((*i).into()),
        AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
        AMQPValue::Float(f) => HeaderValue::Float((*f).into()),
        AMQPValue::Double(f) => HeaderValue::Float(*f),
        AMQPValue::DecimalValue(d) => HeaderValue::Decimal {
            scale: d.scale,
            value: d.value,
        },
        AMQPValue::ShortString(s) => HeaderValue::String(s.as_str().to_owned()),
        AMQPValue::LongString(s) => match std::str::from_utf8(s.as_bytes()) {
            Ok(s) => HeaderValue::String(s.to_owned()),
            Err(source) => {
                return Err(DecodingError::InvalidUtf8 {
                    header: path.to_owned(),
                    source,
                })
            }
        },
        AMQPValue::FieldArray(values) => HeaderValue::List(
            values
                .as_slice()
                .iter()
                .enumerate()
                .map(|(i, v)| decode_value(&format!("{path}[{i}]"), v))
                .collect::<Result<_, _>>()?,
        ),
        AMQPValue::Timestamp(t) => HeaderValue::Timestamp(*t),
        AMQPValue::FieldTable(table) => HeaderValue::Table(decode_table(table, Some(path))?),
        AMQPValue::ByteArray(bytes) => HeaderValue::Bytes(bytes.as_slice().to_vec()),
        AMQPValue::Void => HeaderValue::Void,
    };
    Ok(decoded)
}
