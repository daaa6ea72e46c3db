// Wire types for the WebSocket protocol.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ot::{ClientChange, ServerUpdate};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub index: u32,
    pub length: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub id: u32,
    pub range: Range,
}

/// Client viewport dimensions; accepted for protocol compatibility.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Size {
    pub id: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Action {
    pub id: u32,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub selection: Selection,
}

impl Action {
    /// The window's label file: the action id itself when odd, else id - 1.
    pub fn label_id(&self) -> u32 {
        self.id - 1 + self.id % 2
    }

    pub fn content_id(&self) -> u32 {
        self.label_id() + 1
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub changes: Vec<ClientChange>,
    #[serde(default)]
    pub acks: HashMap<u32, u32>,
    #[serde(default)]
    pub sizes: Vec<Size>,
    #[serde(default)]
    pub action: Option<Action>,
}

#[derive(Debug, Default, Serialize)]
pub struct Update {
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub updates: HashMap<u32, ServerUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashes: Option<HashMap<u32, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InitRequest {
    #[serde(rename = "session")]
    pub session_id: Option<Uuid>,
    #[serde(rename = "client")]
    pub client_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct InitResponse {
    #[serde(rename = "session")]
    pub session_id: Uuid,
    #[serde(rename = "client")]
    pub client_id: Uuid,
}
