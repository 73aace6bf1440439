//! Identities of the parties that talk to the queue.

use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// Opaque identity of a worker process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A worker id unique to this process, for workers that were not given an explicit one.
    pub fn unique() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a client that submits jobs or inspects the queue.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ClientId(uuid::Uuid);

impl ClientId {
    pub fn unique() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

/// The party on the other side of a connection to the queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub enum Entity {
    Worker(WorkerId),
    Client(ClientId),
}

impl Entity {
    pub fn client() -> Self {
        Self::Client(ClientId::unique())
    }

    pub fn worker_id(&self) -> Option<&WorkerId> {
        match self {
            Entity::Worker(worker_id) => Some(worker_id),
            Entity::Client(_) => None,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Worker(worker_id) => write!(f, "worker:{worker_id}"),
            Entity::Client(ClientId(id)) => write!(f, "client:{id}"),
        }
    }
}
