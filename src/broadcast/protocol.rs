//! Wire protocol for the broadcast WebSocket server (spec §4.6, §6):
//! inbound subscribe/unsubscribe/ping control frames, outbound welcome,
//! record, and status frames.

use serde::{Deserialize, Serialize};

use crate::schema::CanonicalRecord;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum InboundMessage {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
    Ping,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage<'a> {
    Welcome { connection_id: String },
    Record { #[serde(flatten)] record: &'a CanonicalRecord },
    Status { subscribed: Vec<String>, unsubscribed: Vec<String> },
    Pong,
    Error { message: String },
}

impl<'a> OutboundMessage<'a> {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("OutboundMessage always serializes")
    }
}

pub fn parse_inbound(raw: &str) -> Result<InboundMessage, serde_json::Error> {
    serde_json::from_str(raw)
}
