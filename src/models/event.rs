/// Jetstream frames and the stream messages derived from them

use crate::storage::Cursor;
use serde::Deserialize;

/// Raw JSON frame as sent by Jetstream
#[derive(Debug, Clone, Deserialize)]
pub struct JetstreamEvent {
    pub did: String,
    pub time_us: i64,
    pub kind: String,
    #[serde(default)]
    pub identity: Option<IdentityInfo>,
}

/// Body of an `identity` frame
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityInfo {
    #[serde(default)]
    pub did: Option<String>,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub seq: Option<i64>,
    #[serde(default)]
    pub time: Option<String>,
}

/// Claimed handle/DID binding from an identity message.
/// The DID is untrusted until the handle is resolved independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityEvent {
    pub did: String,
    pub handle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPayload {
    Identity(IdentityEvent),
    /// Any other kind (`account`, `commit`, ...); only advances the cursor
    Other { kind: String },
}

/// One message delivered by a stream source, in stream order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub cursor: Cursor,
    pub payload: StreamPayload,
}

impl StreamMessage {
    pub fn identity(cursor: Cursor, did: &str, handle: Option<&str>) -> Self {
        Self {
            cursor,
            payload: StreamPayload::Identity(IdentityEvent {
                did: did.to_string(),
                handle: handle.map(str::to_string),
            }),
        }
    }

    pub fn other(cursor: Cursor, kind: &str) -> Self {
        Self {
            cursor,
            payload: StreamPayload::Other {
                kind: kind.to_string(),
            },
        }
    }
}

impl From<JetstreamEvent> for StreamMessage {
    fn from(event: JetstreamEvent) -> Self {
        let payload = if event.kind == "identity" {
            let (did, handle) = match event.identity {
                Some(info) => (
                    info.did.unwrap_or(event.did),
                    info.handle.filter(|h| !h.is_empty()),
                ),
                None => (event.did, None),
            };
            StreamPayload::Identity(IdentityEvent { did, handle })
        } else {
            StreamPayload::Other { kind: event.kind }
        };

        Self {
            cursor: event.time_us,
            payload,
        }
    }
}
