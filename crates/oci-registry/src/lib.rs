//! Wire-level types and a distribution client for OCI registries.
//!
//! This crate holds the pieces of the image world that are defined by
//! specifications rather than by this project: content digests, manifests,
//! indexes, image configs, reference grammar and the distribution protocol.
//! The `ocibuild` engine builds on these types; nothing here mutates an
//! image.

pub mod client;
pub mod config;
pub mod digest;
pub mod errors;
pub mod manifest;
pub mod reference;
pub mod secrets;

pub use digest::Digest;
pub use reference::Reference;
