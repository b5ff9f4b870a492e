//! Envelope protocol.
//!
//! Every frame carries exactly one [`Envelope`], encoded with
//! [`nbsync_core::codec::encode_frame`]:
//! ```text
//! ┌──────┬───────────┬────────────┬──────────────┬─────────────┬─────────┬──────┐
//! │ type │ client_id │ request_id │ initiator_id │ notebook_id │ cell_id │ body │
//! │ enum │ string    │ optional   │ optional     │ optional    │ opt.    │ Value│
//! └──────┴───────────┴────────────┴──────────────┴─────────────┴─────────┴──────┘
//! ```
//!
//! `request_id` is present only when the sender wants a reply. Replies echo it
//! and name the requesting client in `initiator_id`; broadcasts caused by a
//! client's action carry that client in `initiator_id` without a `request_id`.

use nbsync_core::{codec, CodecError, Notebook, Patch, Value};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Marker of an accepted update.
pub const WENT_WELL: &str = "👍";
/// Marker of a refused update.
pub const WENT_WRONG: &str = "👎";

/// Message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Session handshake, sent after every (re)open
    Connect = 1,
    /// Keepalive
    Ping = 2,
    Pong = 3,
    /// Patch submitted by a client
    UpdateNotebook = 4,
    /// Patch broadcast by the remote party
    NotebookDiff = 5,
    /// Full document request
    ResetSharedState = 6,
    RunMultipleCells = 7,
    InterruptAll = 8,
}

/// Optional routing fields of an envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteMetadata {
    pub notebook_id: Option<String>,
    pub cell_id: Option<String>,
}

impl RouteMetadata {
    pub fn notebook(notebook_id: impl Into<String>) -> Self {
        Self {
            notebook_id: Some(notebook_id.into()),
            cell_id: None,
        }
    }

    pub fn with_cell(mut self, cell_id: impl Into<String>) -> Self {
        self.cell_id = Some(cell_id.into());
        self
    }

    /// Fill the fields left unset from `defaults`.
    pub fn or(self, defaults: &RouteMetadata) -> Self {
        Self {
            notebook_id: self.notebook_id.or_else(|| defaults.notebook_id.clone()),
            cell_id: self.cell_id.or_else(|| defaults.cell_id.clone()),
        }
    }
}

/// Outer message structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub client_id: String,
    pub request_id: Option<String>,
    pub initiator_id: Option<String>,
    pub notebook_id: Option<String>,
    pub cell_id: Option<String>,
    pub body: Value,
}

impl Envelope {
    pub fn new(msg_type: MessageType, client_id: impl Into<String>, body: Value) -> Self {
        Self {
            msg_type,
            client_id: client_id.into(),
            request_id: None,
            initiator_id: None,
            notebook_id: None,
            cell_id: None,
            body,
        }
    }

    pub fn with_route(mut self, route: &RouteMetadata) -> Self {
        self.notebook_id = route.notebook_id.clone();
        self.cell_id = route.cell_id.clone();
        self
    }

    pub fn route(&self) -> RouteMetadata {
        RouteMetadata {
            notebook_id: self.notebook_id.clone(),
            cell_id: self.cell_id.clone(),
        }
    }

    /// Reply to `request`, addressed back to the client that sent it.
    pub fn reply(request: &Envelope, sender_id: impl Into<String>, body: Value) -> Self {
        Self {
            msg_type: request.msg_type,
            client_id: sender_id.into(),
            request_id: request.request_id.clone(),
            initiator_id: Some(request.client_id.clone()),
            notebook_id: request.notebook_id.clone(),
            cell_id: request.cell_id.clone(),
            body,
        }
    }

    /// Unrequested message caused by `initiator` (or by nobody in particular).
    pub fn broadcast(
        msg_type: MessageType,
        sender_id: impl Into<String>,
        initiator: Option<&str>,
        body: Value,
    ) -> Self {
        Self {
            initiator_id: initiator.map(str::to_string),
            ..Self::new(msg_type, sender_id, body)
        }
    }

    /// Whether this envelope answers a request made by `client_id`.
    pub fn is_reply_for(&self, client_id: &str) -> bool {
        self.request_id.is_some() && self.initiator_id.as_deref() == Some(client_id)
    }

    /// Encode to a delimited frame.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode_frame(self)
    }

    /// Decode a delimited frame.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        codec::decode_frame(frame)
    }
}

fn field<'a>(body: &'a Value, key: &str, what: &str) -> Result<&'a Value, ClientError> {
    body.get(key)
        .ok_or_else(|| ClientError::Protocol(format!("{what} without `{key}`")))
}

fn counter(body: &Value, what: &str) -> Result<u64, ClientError> {
    field(body, "counter", what)?
        .as_u64()
        .ok_or_else(|| ClientError::Protocol(format!("{what} has a non-integer counter")))
}

/// Body of an `UpdateNotebook` request.
pub fn update_body(patch: &Patch) -> Value {
    Value::map_from([("updates", patch.to_value())])
}

/// Patch carried by an `UpdateNotebook` request.
pub fn updates_from_body(body: &Value) -> Result<Patch, ClientError> {
    Ok(Patch::from_value(field(body, "updates", "update request")?)?)
}

/// Body of a `RunMultipleCells` request.
pub fn run_cells_body(cell_ids: &[String]) -> Value {
    Value::map_from([(
        "cells",
        Value::Array(cell_ids.iter().cloned().map(Value::Str).collect()),
    )])
}

/// Acknowledgement of an `UpdateNotebook` request:
/// `{response: {update_went_well: "👍" | "👎", why_not?}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateAck {
    pub went_well: bool,
    pub why_not: Option<String>,
}

impl UpdateAck {
    pub fn accepted() -> Self {
        Self {
            went_well: true,
            why_not: None,
        }
    }

    pub fn rejected(why_not: impl Into<String>) -> Self {
        Self {
            went_well: false,
            why_not: Some(why_not.into()),
        }
    }

    pub fn to_body(&self) -> Value {
        let marker = if self.went_well { WENT_WELL } else { WENT_WRONG };
        let mut response = vec![("update_went_well", Value::from(marker))];
        if let Some(why) = &self.why_not {
            response.push(("why_not", Value::from(why.as_str())));
        }
        Value::map_from([("response", Value::map_from(response))])
    }

    pub fn from_body(body: &Value) -> Result<Self, ClientError> {
        let response = field(body, "response", "update acknowledgement")?;
        let marker = field(response, "update_went_well", "update acknowledgement")?
            .as_str()
            .ok_or_else(|| ClientError::Protocol("update_went_well is not a string".into()))?;
        let went_well = match marker {
            WENT_WELL => true,
            WENT_WRONG => false,
            other => {
                return Err(ClientError::Protocol(format!(
                    "unknown update_went_well marker {other:?}"
                )))
            }
        };
        let why_not = response
            .get("why_not")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self { went_well, why_not })
    }
}

/// Body of a `NotebookDiff` broadcast: `{counter, patches}`.
#[derive(Debug, Clone, PartialEq)]
pub struct NotebookDiff {
    pub counter: u64,
    pub patch: Patch,
}

impl NotebookDiff {
    pub fn to_body(&self) -> Value {
        Value::map_from([
            ("counter", Value::Int(self.counter as i64)),
            ("patches", self.patch.to_value()),
        ])
    }

    pub fn from_body(body: &Value) -> Result<Self, ClientError> {
        Ok(Self {
            counter: counter(body, "notebook diff")?,
            patch: Patch::from_value(field(body, "patches", "notebook diff")?)?,
        })
    }
}

/// Reply to `ResetSharedState`: the whole document and the remote counter.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedState {
    pub notebook: Notebook,
    pub counter: u64,
}

impl SharedState {
    pub fn to_body(&self) -> Value {
        Value::map_from([
            ("notebook", self.notebook.to_value()),
            ("counter", Value::Int(self.counter as i64)),
        ])
    }

    pub fn from_body(body: &Value) -> Result<Self, ClientError> {
        let notebook = Notebook::from_value(field(body, "notebook", "shared state")?)
            .map_err(|e| ClientError::Protocol(format!("shared state: {e}")))?;
        Ok(Self {
            notebook,
            counter: counter(body, "shared state")?,
        })
    }
}
