//! Command system: the autocomplete graph pushed to clients and the
//! prefix-matched registry that dispatches chat-originated commands.

pub mod graph;
pub mod registry;
