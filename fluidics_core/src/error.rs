use crate::protocol::{Opcode, ProtocolError};
use thiserror::Error;

/// Failure of a single command exchange with a peripheral.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The peripheral answered with a non-OK return code.
    #[error("board {address:#04x} rejected {opcode}: {source}")]
    Protocol {
        address: u8,
        opcode: Opcode,
        #[source]
        source: ProtocolError,
    },
    #[error("bus error: {0}")]
    Bus(String),
    #[error("malformed reply: {0}")]
    Decode(String),
}

impl CommandError {
    /// Return code carried by a protocol-level failure, if any.
    pub fn protocol(&self) -> Option<ProtocolError> {
        match self {
            Self::Protocol { source, .. } => Some(*source),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum FluidicsError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("unknown step '{0}'")]
    UnknownStep(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("switch error: {0}")]
    Switch(String),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
