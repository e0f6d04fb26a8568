//! noderig: declarative, idempotent node provisioning for Kubernetes.
//!
//! Resources converge one host at a time through a [`transport::Runner`].
//! A failed plan unwinds every resource it applied, last first.

pub mod cli;
pub mod core;
pub mod error;
pub mod provenance;
pub mod resources;
pub mod seed;
pub mod transport;
