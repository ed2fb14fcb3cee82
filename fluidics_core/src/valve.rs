use crate::error::CommandError;
use crate::protocol::CommandChannel;
use std::fmt;

/// One of the two flow paths a valve selects. `A` is path 0 (output low),
/// `B` is path 1 (output high).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Branch {
    #[default]
    A,
    B,
}

impl Branch {
    pub const fn from_path(path: u8) -> Option<Self> {
        match path {
            0 => Some(Self::A),
            1 => Some(Self::B),
            _ => None,
        }
    }

    #[inline]
    pub const fn level(self) -> bool {
        matches!(self, Self::B)
    }

    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::A => "A",
            Self::B => "B",
        })
    }
}

/// Drive a valve output to `branch`. Fire-and-forget and idempotent.
pub fn set_valve(ch: &CommandChannel, pin: u8, branch: Branch) -> Result<(), CommandError> {
    tracing::debug!(address = ch.address(), pin, %branch, "valve");
    ch.digital_write(pin, branch.level())
}
