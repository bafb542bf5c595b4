//! iCloud Photos access: CloudKit record queries and their decoding.

pub mod error;
pub mod photos;
