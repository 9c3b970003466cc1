//! Message-bus wire protocol.
//!
//! Every topic carries exactly one message type, and bodies are camelCase JSON:
//!
//! | Topic               | Direction       | Body                  |
//! |---------------------|-----------------|-----------------------|
//! | `register`          | peer -> central | [`RegisterMessage`]   |
//! | `{id}-register`     | central -> peer | [`RegisterAck`]       |
//! | `run`               | peer -> central | [`PeerRunMessage`]    |
//! | `{id}-run`          | central -> peer | [`CentralRunMessage`] |
//! | `finished`          | peer -> central | [`FinishedMessage`]   |
//!
//! Inbound payloads are decoded once at the boundary with
//! [`InboundMessage::decode`], so handlers only ever see typed messages.

use crate::run_models::RunError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use ts_rs::TS;

/// Topic names.
pub mod topics {
    pub const REGISTER: &str = "register";
    pub const RUN: &str = "run";
    pub const FINISHED: &str = "finished";

    /// Registration acknowledgements addressed to one participant.
    pub fn participant_register(participant_id: &str) -> String {
        format!("{participant_id}-register")
    }

    /// Central results addressed to one participant.
    pub fn participant_run(participant_id: &str) -> String {
        format!("{participant_id}-run")
    }
}

/// Send and receive timestamps in milliseconds since the epoch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, TS)]
pub struct DebugTimes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<i64>,
}

impl DebugTimes {
    pub fn sent_at(sent: i64) -> Self {
        Self {
            sent: Some(sent),
            received: None,
        }
    }
}

/// A peer announcing that it joined a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMessage {
    pub id: String,
    pub run_id: String,
}

/// The central node confirming a peer's registration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAck {
    pub run_id: String,
}

/// A peer delivering one iteration's result (or its failure).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct PeerRunMessage {
    pub id: String,
    pub run_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,

    /// Archive parts the peer is uploading alongside this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,

    /// Pipeline step the result belongs to.
    #[serde(default)]
    pub step: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u64>,

    #[serde(default)]
    pub debug: DebugTimes,
}

/// The central node delivering its result to one participant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct CentralRunMessage {
    pub run_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,

    /// Whether this is the final result of the step.
    #[serde(default)]
    pub success: bool,

    /// Archive parts the participant should download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,

    /// Pipeline step the result belongs to.
    #[serde(default)]
    pub step: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u64>,

    #[serde(default)]
    pub debug: DebugTimes,
}

impl CentralRunMessage {
    /// An error broadcast for `run_id`.
    pub fn error(run_id: impl Into<String>, error: RunError) -> Self {
        Self {
            run_id: run_id.into(),
            output: None,
            error: Some(error),
            success: false,
            files: None,
            step: 0,
            iteration: None,
            debug: DebugTimes::default(),
        }
    }
}

/// A peer confirming that it fetched the final files.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase")]
pub struct FinishedMessage {
    pub id: String,
    pub run_id: String,
}

/// What a peer run message carries.
#[derive(Debug, Clone, PartialEq)]
pub enum RunPayload {
    Output(Value),
    Error(RunError),
}

impl PeerRunMessage {
    /// The delivered value. An error takes precedence over an output.
    pub fn payload(&self) -> Result<RunPayload, MessageError> {
        match (&self.error, &self.output) {
            (Some(error), _) => Ok(RunPayload::Error(error.clone())),
            (None, Some(output)) => Ok(RunPayload::Output(output.clone())),
            (None, None) => Err(MessageError::Malformed {
                topic: topics::RUN.to_string(),
                reason: "Malformed client output".to_string(),
            }),
        }
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Register(RegisterMessage),
    PeerRun(PeerRunMessage),
    Finished(FinishedMessage),
    RegisterAck(RegisterAck),
    CentralRun(CentralRunMessage),
}

impl InboundMessage {
    /// Decode a payload received on `topic` by `participant_id`.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::UnknownTopic`] for topics outside the protocol and
    /// [`MessageError::Malformed`] for bodies that do not match the topic's type.
    pub fn decode(topic: &str, participant_id: &str, payload: &[u8]) -> Result<Self, MessageError> {
        let malformed = |e: serde_json::Error| MessageError::Malformed {
            topic: topic.to_string(),
            reason: e.to_string(),
        };

        match topic {
            topics::REGISTER => serde_json::from_slice(payload)
                .map(InboundMessage::Register)
                .map_err(malformed),
            topics::RUN => serde_json::from_slice(payload)
                .map(InboundMessage::PeerRun)
                .map_err(malformed),
            topics::FINISHED => serde_json::from_slice(payload)
                .map(InboundMessage::Finished)
                .map_err(malformed),
            t if t == topics::participant_register(participant_id) => {
                serde_json::from_slice(payload)
                    .map(InboundMessage::RegisterAck)
                    .map_err(malformed)
            }
            t if t == topics::participant_run(participant_id) => serde_json::from_slice(payload)
                .map(InboundMessage::CentralRun)
                .map_err(malformed),
            other => Err(MessageError::UnknownTopic(other.to_string())),
        }
    }
}

/// Failure to interpret an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    UnknownTopic(String),
    Malformed { topic: String, reason: String },
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::UnknownTopic(topic) => write!(f, "Unknown topic: {topic}"),
            MessageError::Malformed { topic, reason } => {
                write!(f, "Malformed message on {topic}: {reason}")
            }
        }
    }
}

impl std::error::Error for MessageError {}
