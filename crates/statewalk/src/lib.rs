//! Dependency-graph traversal scheduler for stateful integration tests.
//!
//! Tests declare the object states they need and produce. The scheduler walks
//! the setup graph depth first so every state is built once, reused by all of
//! its dependents and cleaned up after the last of them.

pub mod command;
pub mod errors;
pub mod events;
pub mod graph;
pub mod params;
pub mod parse;
pub mod restrictions;
pub mod runner;
pub mod runtime;
pub mod setup_list;
pub mod tasks;
pub mod visualize;

pub use command::*;
pub use errors::*;
pub use events::*;
pub use graph::*;
pub use params::*;
pub use parse::*;
pub use restrictions::*;
pub use runner::*;
pub use runtime::*;
pub use setup_list::*;
pub use tasks::*;
pub use visualize::*;
