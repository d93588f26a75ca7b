#![doc = include_str!("../README.md")]

mod error;

pub mod classify;
pub mod crypto;
pub mod engine;
pub mod framing;
pub mod header;
pub mod registry;
pub mod session;

pub use classify::DecodedRecord;
pub use engine::{load_hex_dump, spawn_session, DecoderEngine, Encoding, SessionConfig, SessionHandle};
pub use error::{Error, Result};
