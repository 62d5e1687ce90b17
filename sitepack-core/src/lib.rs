//! Packing a manifest of named items into one archive container and
//! inserting it as a single block.

pub mod archive;
pub mod bucket;
pub mod client;
pub mod compose;
pub mod container;
pub mod error;
pub mod local_store;
pub mod manifest;
pub mod metadata;
pub mod path_safety;
pub mod resolve;
pub mod zip;
