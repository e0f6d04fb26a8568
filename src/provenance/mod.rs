//! Provenance: JSONL event log and BLAKE3 desired-state hashing.

pub mod eventlog;
pub mod hasher;
