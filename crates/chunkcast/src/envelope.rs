//! Wire contract between the Dispatcher and the Workers.
//!
//! A chunk travels as a UTF-8 text payload. Everything needed to put the
//! result back in the right slot travels as string attributes, because the
//! broker makes no promise about delivery order:
//!
//! | Attribute        | Value                                  |
//! |------------------|----------------------------------------|
//! | `job_id`         | Job the chunk belongs to               |
//! | `sequence_index` | Position of the chunk, decimal          |
//! | `approx_tokens`  | Approximate token count, decimal        |

use crate::{Chunk, DecodeError, Delivery, MessageId};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub const ATTR_JOB_ID: &str = "job_id";
pub const ATTR_SEQUENCE_INDEX: &str = "sequence_index";
pub const ATTR_APPROX_TOKENS: &str = "approx_tokens";

/// String attributes attached to a message.
pub type Attributes = BTreeMap<String, String>;

/// A message as handed to [`crate::Broker::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub data: Bytes,
    pub attributes: Attributes,
}

impl OutboundMessage {
    /// Encodes one chunk of `job_id`.
    pub fn encode(job_id: &str, chunk: &Chunk) -> Self {
        let mut attributes = Attributes::new();
        attributes.insert(ATTR_JOB_ID.to_string(), job_id.to_string());
        attributes.insert(
            ATTR_SEQUENCE_INDEX.to_string(),
            chunk.sequence_index.to_string(),
        );
        attributes.insert(
            ATTR_APPROX_TOKENS.to_string(),
            chunk.approx_token_count.to_string(),
        );

        Self {
            data: Bytes::copy_from_slice(chunk.text.as_bytes()),
            attributes,
        }
    }

    /// Size of payload plus attributes, as counted against broker limits.
    pub fn size(&self) -> usize {
        self.data.len()
            + self
                .attributes
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// A chunk as seen by a Worker, together with its broker metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub chunk: Chunk,
    pub message_id: MessageId,
    pub publish_time: DateTime<Utc>,
}

/// Where a delivered message belongs: enough to address a result slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    pub job_id: String,
    pub sequence_index: usize,
}

impl Routing {
    /// Reads the job and slot a delivery reports against.
    ///
    /// This only looks at attributes, so a result slot can be addressed even
    /// when the payload itself is unreadable.
    pub fn from_attributes(attributes: &Attributes) -> Result<Self, DecodeError> {
        let job_id = attributes
            .get(ATTR_JOB_ID)
            .filter(|v| !v.is_empty())
            .ok_or(DecodeError::MissingAttribute(ATTR_JOB_ID))?
            .clone();
        let sequence_index = parse_attr(attributes, ATTR_SEQUENCE_INDEX)?;
        Ok(Self {
            job_id,
            sequence_index,
        })
    }
}

impl MessageEnvelope {
    /// Rebuilds the envelope from a delivery.
    ///
    /// `approx_tokens` is optional on the wire and recomputed as zero when
    /// absent; everything else is required.
    pub fn decode(delivery: &Delivery) -> Result<(Routing, Self), DecodeError> {
        let routing = Routing::from_attributes(&delivery.attributes)?;
        let approx_token_count = match delivery.attributes.get(ATTR_APPROX_TOKENS) {
            Some(_) => parse_attr(&delivery.attributes, ATTR_APPROX_TOKENS)?,
            None => 0,
        };
        let text = core::str::from_utf8(&delivery.data)
            .map_err(|_| DecodeError::InvalidUtf8)?
            .to_string();

        let envelope = Self {
            chunk: Chunk {
                sequence_index: routing.sequence_index,
                text,
                approx_token_count,
            },
            message_id: delivery.message_id.clone(),
            publish_time: delivery.publish_time,
        };
        Ok((routing, envelope))
    }
}

fn parse_attr(attributes: &Attributes, name: &'static str) -> Result<usize, DecodeError> {
    let raw = attributes
        .get(name)
        .ok_or(DecodeError::MissingAttribute(name))?;
    raw.parse().map_err(|_| DecodeError::InvalidAttribute {
        name,
        value: raw.clone(),
    })
}
