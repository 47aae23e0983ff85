//! Opaque handles for registry-owned remote objects.
//!
//! # Responsibility
//! - Let callers address long-lived remote objects by token only.
//! - Own every live client, vault and stream on behalf of the caller.
//!
//! # Invariants
//! - A token resolves to at most one live object.
//! - Tokens come from a monotonic counter and are never reassigned within one
//!   registry, so a closed handle can never alias a newer object.

mod registry;

pub use registry::{HandleObject, HandleRegistry, OwnerReleased};

use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Caller-visible token identifying one registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u64);

impl Handle {
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl Display for Handle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Handle {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

/// Kind tag stored with every registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Client,
    Vault,
    Reader,
    Writer,
}

impl HandleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Vault => "vault",
            Self::Reader => "reader",
            Self::Writer => "writer",
        }
    }
}

impl Display for HandleKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
