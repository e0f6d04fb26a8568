//! Core engine: manifest types, state, plans, execution.

pub mod executor;
pub mod graph;
pub mod instrument;
pub mod lock;
pub mod parser;
pub mod registry;
pub mod state;
pub mod types;
