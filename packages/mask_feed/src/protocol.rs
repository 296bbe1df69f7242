//! Wire Protocol Types
//!
//! Inbound messages published by the detection backend. Every JSON message is
//! an object tagged by a `type` field; binary frames carry raw video frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::FeedError;

/// One physical frame as read from (or written to) the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// The `type` discriminators this client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Frame,
    Stats,
    History,
    TimeStats,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] = [
        MessageKind::Frame,
        MessageKind::Stats,
        MessageKind::History,
        MessageKind::TimeStats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Frame => "frame",
            MessageKind::Stats => "stats",
            MessageKind::History => "history",
            MessageKind::TimeStats => "time_stats",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| FeedError::Malformed(format!("unknown message type: {s}")))
    }
}

/// Video frame contents. The backend either embeds an encoded image as a
/// string (base64 or data URL) or ships the image bytes as a binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameData {
    Encoded(String),
    Raw(Vec<u8>),
}

impl FrameData {
    pub fn len(&self) -> usize {
        match self {
            FrameData::Encoded(s) => s.len(),
            FrameData::Raw(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePayload {
    pub data: FrameData,
}

/// JSON shape of a `frame` message. Older backends put the image in `data`.
#[derive(Deserialize)]
struct FrameWire {
    #[serde(alias = "data")]
    frame: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsPayload {
    pub total: u64,
    pub with_mask: u64,
    pub without_mask: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub timestamp: DateTime<Utc>,
    pub with_mask: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPayload {
    pub history: Vec<HistoryRecord>,
}

/// Durations are in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeStatsPayload {
    pub avg_time_with_mask: f64,
    pub avg_time_without_mask: f64,
    pub total_time: f64,
}

/// A classified message received from the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Frame(FramePayload),
    Stats(StatsPayload),
    History(HistoryPayload),
    TimeStats(TimeStatsPayload),
    /// A well-formed message with a `type` this client does not know about.
    Unknown {
        kind: String,
        payload: Map<String, Value>,
    },
}

impl InboundMessage {
    /// The known kind of this message, `None` for unknown types.
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            InboundMessage::Frame(_) => Some(MessageKind::Frame),
            InboundMessage::Stats(_) => Some(MessageKind::Stats),
            InboundMessage::History(_) => Some(MessageKind::History),
            InboundMessage::TimeStats(_) => Some(MessageKind::TimeStats),
            InboundMessage::Unknown { .. } => None,
        }
    }

    /// The raw `type` discriminator.
    pub fn type_name(&self) -> &str {
        match self {
            InboundMessage::Unknown { kind, .. } => kind,
            other => other.kind().map(|k| k.as_str()).unwrap_or_default(),
        }
    }

    /// Classify one transport frame.
    pub fn decode(frame: WireFrame) -> Result<Self, FeedError> {
        match frame {
            WireFrame::Text(text) => Self::from_json(&text),
            WireFrame::Binary(bytes) => Ok(InboundMessage::Frame(FramePayload {
                data: FrameData::Raw(bytes),
            })),
        }
    }

    /// Classify a JSON text payload.
    pub fn from_json(text: &str) -> Result<Self, FeedError> {
        let Value::Object(map) = serde_json::from_str::<Value>(text)? else {
            return Err(FeedError::Malformed("expected a JSON object".into()));
        };

        let kind = match map.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(_) => return Err(FeedError::Malformed("`type` is not a string".into())),
            None => return Err(FeedError::Malformed("missing `type` field".into())),
        };

        let Ok(known) = kind.parse::<MessageKind>() else {
            return Ok(InboundMessage::Unknown { kind, payload: map });
        };

        let value = Value::Object(map);
        let msg = match known {
            MessageKind::Frame => {
                let wire: FrameWire = serde_json::from_value(value)?;
                InboundMessage::Frame(FramePayload {
                    data: FrameData::Encoded(wire.frame),
                })
            }
            MessageKind::Stats => InboundMessage::Stats(serde_json::from_value(value)?),
            MessageKind::History => InboundMessage::History(serde_json::from_value(value)?),
            MessageKind::TimeStats => InboundMessage::TimeStats(serde_json::from_value(value)?),
        };
        Ok(msg)
    }
}

/// History timestamps arrive as RFC 3339 strings, naive ISO strings (UTC), or
/// epoch numbers (seconds, or milliseconds above 1e11).
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, de};

    const MILLIS_THRESHOLD: f64 = 1e11;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => from_epoch(n)
                .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {n}"))),
            Raw::Text(s) => parse_text(&s)
                .ok_or_else(|| de::Error::custom(format!("unrecognised timestamp: {s}"))),
        }
    }

    pub(super) fn parse_text(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub(super) fn from_epoch(n: f64) -> Option<DateTime<Utc>> {
        if !n.is_finite() || n < 0.0 {
            return None;
        }
        let millis = if n > MILLIS_THRESHOLD { n } else { n * 1000.0 };
        DateTime::from_timestamp_millis(millis as i64)
    }
}
