//! Operational-transform engine: per-document history and the multi-file
//! command-loop server.

mod document;
mod server;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use paguridae_delta::Delta;

pub use document::Document;
pub use server::{spawn, ServerHandle, UpdateAllFn, UpdateFn};

/// An authoritative update for one document, scoped to what the receiving
/// client has acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerUpdate {
    pub id: u32,
    pub delta: Delta,
    pub base: u32,
    pub version: u32,
    #[serde(
        rename = "last_committed_client_version",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub last_committed_client_version: Option<u32>,
}

/// A change submitted by a client against the version it last saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientChange {
    pub id: u32,
    pub delta: Delta,
    pub base: u32,
    #[serde(default)]
    pub client_version: u32,
}

/// One entry on a client's event stream.
#[derive(Debug, Clone, Default)]
pub struct Event {
    pub connected_client_id: Option<Uuid>,
    pub updates: Vec<ServerUpdate>,
    pub created_file_ids: Vec<u32>,
    pub closed_file_ids: Vec<u32>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OtError {
    #[error("file id {actual} does not match document {expected}")]
    FileIdMismatch { expected: u32, actual: u32 },
    #[error("change base {base} is ahead of version {version}")]
    FutureBase { base: u32, version: u32 },
    #[error("version {base} is too old, oldest retained version is {oldest}")]
    HistoryTooOld { base: u32, oldest: u32 },
    #[error("running out of changes to undo")]
    NothingToUndo,
    #[error("running out of undos")]
    NothingToRedo,
    #[error("cannot find file {0}")]
    UnknownFile(u32),
    #[error("unknown client {0}")]
    UnknownClient(Uuid),
    #[error("cannot allocate new file id")]
    IdSpaceExhausted,
    #[error("server stopped")]
    ServerStopped,
}
