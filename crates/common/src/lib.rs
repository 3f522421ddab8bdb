//! Common types shared across `fieldcrypt` crates: the status/error carrier
//! and the wire-protocol forms exchanged with the host driver.

pub mod error;
pub mod protocol;

pub use error::{Error, ErrorKind, Status};

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
