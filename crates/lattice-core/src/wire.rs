//! Hub wire format — framed JSON arrays over the websocket.
//!
//! Every frame is a JSON array whose first element is a numeric message
//! type. The codes ARE the protocol; peers in other languages hard-code
//! them, so they must never change:
//!
//! ```text
//! [0, connId, 1, serverIdent]        WELCOME
//! [2, callId, procUri, args…]        CALL
//! [3, callId, result]                CALLRESULT
//! [4, callId, errorUri, errorDesc]   CALLERROR
//! [5, topicUri]                      SUBSCRIBE
//! [6, topicUri]                      UNSUBSCRIBE
//! [7, topicUri, event]               PUBLISH
//! [8, topicUri, event]               EVENT
//! ```
//!
//! Frames are heterogeneous arrays, so encoding and decoding are written
//! by hand over `serde_json::Value` rather than derived.

use serde_json::{json, Value};

/// Protocol version carried in the WELCOME frame.
pub const PROTOCOL_VERSION: u64 = 1;

const MSG_WELCOME: u64 = 0;
const MSG_CALL: u64 = 2;
const MSG_CALL_RESULT: u64 = 3;
const MSG_CALL_ERROR: u64 = 4;
const MSG_SUBSCRIBE: u64 = 5;
const MSG_UNSUBSCRIBE: u64 = 6;
const MSG_PUBLISH: u64 = 7;
const MSG_EVENT: u64 = 8;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON array")]
    NotAnArray,
    #[error("unknown message type {0}")]
    UnknownMessageType(Value),
    #[error("malformed {0} frame")]
    Malformed(&'static str),
}

/// One protocol frame, either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Welcome {
        conn_id: String,
        server_ident: String,
    },
    Call {
        call_id: String,
        uri: String,
        args: Vec<Value>,
    },
    CallResult {
        call_id: String,
        result: Value,
    },
    CallError {
        call_id: String,
        error_uri: String,
        description: String,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        event: Value,
    },
    Event {
        topic: String,
        event: Value,
    },
}

impl Frame {
    /// Decode a single text frame.
    pub fn parse(text: &str) -> Result<Frame, WireError> {
        let value: Value = serde_json::from_str(text)?;
        let items = value.as_array().ok_or(WireError::NotAnArray)?;
        let msg_type = items
            .first()
            .and_then(Value::as_u64)
            .ok_or(WireError::NotAnArray)?;

        match msg_type {
            MSG_WELCOME => Ok(Frame::Welcome {
                conn_id: string_at(items, 1, "WELCOME")?,
                server_ident: string_at(items, 3, "WELCOME")?,
            }),
            MSG_CALL => {
                if items.len() < 3 {
                    return Err(WireError::Malformed("CALL"));
                }
                Ok(Frame::Call {
                    call_id: string_at(items, 1, "CALL")?,
                    uri: string_at(items, 2, "CALL")?,
                    args: items[3..].to_vec(),
                })
            }
            MSG_CALL_RESULT => Ok(Frame::CallResult {
                call_id: string_at(items, 1, "CALLRESULT")?,
                result: items.get(2).cloned().unwrap_or(Value::Null),
            }),
            MSG_CALL_ERROR => Ok(Frame::CallError {
                call_id: string_at(items, 1, "CALLERROR")?,
                error_uri: string_at(items, 2, "CALLERROR")?,
                description: string_at(items, 3, "CALLERROR")?,
            }),
            MSG_SUBSCRIBE => Ok(Frame::Subscribe {
                topic: string_at(items, 1, "SUBSCRIBE")?,
            }),
            MSG_UNSUBSCRIBE => Ok(Frame::Unsubscribe {
                topic: string_at(items, 1, "UNSUBSCRIBE")?,
            }),
            MSG_PUBLISH => {
                if items.len() < 3 {
                    return Err(WireError::Malformed("PUBLISH"));
                }
                Ok(Frame::Publish {
                    topic: string_at(items, 1, "PUBLISH")?,
                    event: items[2].clone(),
                })
            }
            MSG_EVENT => {
                if items.len() < 3 {
                    return Err(WireError::Malformed("EVENT"));
                }
                Ok(Frame::Event {
                    topic: string_at(items, 1, "EVENT")?,
                    event: items[2].clone(),
                })
            }
            _ => Err(WireError::UnknownMessageType(items[0].clone())),
        }
    }

    /// Encode to the on-wire text form.
    pub fn to_message(&self) -> String {
        let value = match self {
            Frame::Welcome {
                conn_id,
                server_ident,
            } => json!([MSG_WELCOME, conn_id, PROTOCOL_VERSION, server_ident]),
            Frame::Call { call_id, uri, args } => {
                let mut items = vec![json!(MSG_CALL), json!(call_id), json!(uri)];
                items.extend(args.iter().cloned());
                Value::Array(items)
            }
            Frame::CallResult { call_id, result } => {
                json!([MSG_CALL_RESULT, call_id, result])
            }
            Frame::CallError {
                call_id,
                error_uri,
                description,
            } => json!([MSG_CALL_ERROR, call_id, error_uri, description]),
            Frame::Subscribe { topic } => json!([MSG_SUBSCRIBE, topic]),
            Frame::Unsubscribe { topic } => json!([MSG_UNSUBSCRIBE, topic]),
            Frame::Publish { topic, event } => json!([MSG_PUBLISH, topic, event]),
            Frame::Event { topic, event } => json!([MSG_EVENT, topic, event]),
        };
        value.to_string()
    }
}

fn string_at(items: &[Value], index: usize, frame: &'static str) -> Result<String, WireError> {
    items
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(WireError::Malformed(frame))
}
