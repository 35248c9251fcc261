//! Wire types for the browserd session channel.
//!
//! This crate contains the serde-serializable types exchanged between the
//! server and the in-browser remote agent, plus the REST body shapes of the
//! session lifecycle endpoints. These types represent the "protocol layer" -
//! the shapes of data as they appear on the wire.
//!
//! Types in this crate are pure data: no behavior beyond
//! serialization/deserialization and a handful of constructors.

pub mod command;
pub mod message;
pub mod session;

pub use command::*;
pub use message::*;
pub use session::*;
