//! Codec configuration decoding and volume-level translation.
//!
//! This crate is the non-async, non-I/O core shared by the transport
//! daemon: it knows how to decode an A2DP configuration blob into
//! channels/sampling-rate/format, how SCO codecs map to a fixed format,
//! and how to translate between centibel levels and Bluetooth volume
//! units. Everything that touches sockets, D-Bus or task scheduling lives
//! one layer up, in `btd_transport`.

pub mod codec;
pub mod error;
pub mod volume;

pub use error::{Error, ErrorKind, InternalErrorKind, Result};
