//! Numeric error codes shared by every fleetgrid error type.
//!
//! Each crate keeps its own `thiserror` enum; `code()` on those enums maps
//! into this table so RPC-facing callers can report code plus message.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidConfig,
    UnknownScheduler,
    NotFound,
    AlreadyExists,
    Persistence,
    Serialization,
    AllocatorUnavailable,
    ProxyFailure,
    Unresolved,
    Internal,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        match self {
            ErrorCode::InvalidConfig => 1001,
            ErrorCode::UnknownScheduler => 1002,
            ErrorCode::NotFound => 1101,
            ErrorCode::AlreadyExists => 1102,
            ErrorCode::Persistence => 1201,
            ErrorCode::Serialization => 1202,
            ErrorCode::AllocatorUnavailable => 1301,
            ErrorCode::ProxyFailure => 1302,
            ErrorCode::Unresolved => 1401,
            ErrorCode::Internal => 1999,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}
