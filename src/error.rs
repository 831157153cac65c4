//! Typed failure modes.
//!
//! Plumbing code propagates `anyhow::Error`; the two failure classes that callers
//! need to tell apart are concrete types so they can be recovered with
//! `anyhow::Error::downcast_ref`.
//!
//! - `ConfigError`: the cascade cannot be compiled. Fatal to that `compile()` call.
//! - `ProtocolError`: a custom-node peer broke the handshake/sequence contract.
//!   Fatal to that session only.
//!
//! Anything else surfacing from I/O is transient and handled at the smallest scope.

use crate::cascade::NodeType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `(type, name)` has no registered factory.
    UnknownElement { node_type: NodeType, name: String },
    DuplicateNodeId(String),
    /// An edge references a node id that is not declared.
    UnknownEdgeEndpoint {
        source: String,
        target: String,
        missing: String,
    },
    /// Topological sort could not place these nodes.
    Cycle(Vec<String>),
    /// A source node was used as an edge target.
    SourceWithInput(String),
    InvalidParameter {
        node: String,
        key: String,
        reason: String,
    },
    /// A node needs a collaborator (bus, store, endpoint) that is not configured.
    MissingCollaborator { node: String, collaborator: String },
    /// Cascade names key the scenario board, so they must be non-empty, free of `/`, and unique.
    InvalidCascadeName { name: String, reason: String },
    Malformed(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::UnknownElement { node_type, name } => {
                write!(f, "unknown element '{}' for node type '{}'", name, node_type)
            }
            ConfigError::DuplicateNodeId(id) => write!(f, "duplicate node id '{}'", id),
            ConfigError::UnknownEdgeEndpoint {
                source,
                target,
                missing,
            } => write!(
                f,
                "edge {} -> {} references unknown node '{}'",
                source, target, missing
            ),
            ConfigError::Cycle(nodes) => {
                write!(f, "cycle detected among nodes [{}]", nodes.join(", "))
            }
            ConfigError::SourceWithInput(id) => {
                write!(f, "source node '{}' cannot be an edge target", id)
            }
            ConfigError::InvalidParameter { node, key, reason } => {
                write!(f, "node '{}': invalid parameter '{}': {}", node, key, reason)
            }
            ConfigError::MissingCollaborator { node, collaborator } => {
                write!(f, "node '{}' requires a configured {}", node, collaborator)
            }
            ConfigError::InvalidCascadeName { name, reason } => {
                write!(f, "invalid cascade name '{}': {}", name, reason)
            }
            ConfigError::Malformed(message) => write!(f, "malformed cascade: {}", message),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    HandshakeAck { expected: u64, got: u64 },
    ProcessAck { expected: u64, got: u64 },
    UnsupportedImageType(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::HandshakeAck { expected, got } => {
                write!(f, "handshake ack mismatch: expected {}, got {}", expected, got)
            }
            ProtocolError::ProcessAck { expected, got } => {
                write!(f, "process ack mismatch: expected {}, got {}", expected, got)
            }
            ProtocolError::UnsupportedImageType(kind) => {
                write!(f, "peer negotiated unsupported image type '{}'", kind)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
