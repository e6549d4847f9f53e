//! JSON envelopes exchanged over the daemon's command channel.
//!
//! A request frame is `{"command": <name>, "data": <object>}`; every
//! response frame is either `{"status": "ok", "data": …}` or
//! `{"status": "error", "error_message": …}`. One request gets exactly
//! one response, then the connection is closed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::TaskStatus;

/// One decoded request frame. `data` defaults to JSON `null` so commands
/// without a payload can omit it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub command: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(command: impl Into<String>, data: Value) -> Self {
        Self {
            command: command.into(),
            data,
        }
    }
}

/// One response frame, tagged by `status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Ok { data: Value },
    Error { error_message: String },
}

impl Response {
    pub fn ok(data: impl Serialize) -> Self {
        Self::Ok {
            data: serde_json::to_value(data)
                .expect("Response data always serializes"),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error_message: message.into(),
        }
    }
}

/// List entry returned by the `list_active_transfers` and
/// `list_completed_transfers` commands.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub task_added: String,
    pub task_status: TaskStatus,
}

/// Payload of the `cancel_transfer` command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelTransfer {
    pub task_id: String,
}

/// Payload of a successful `add_transfer` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferAdded {
    pub task_id: String,
}
