//! Core data model types: message identities, attachment records, and manifest entries.

pub mod attachment;
pub mod manifest;
pub mod message;
