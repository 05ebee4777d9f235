//! Core of the GLUE orchestration engine.
//!
//! A `.glue` program goes through four stages: [`dsl::parse`] produces a
//! [`dsl::Document`], [`registry::Registry::build`] resolves its blocks into
//! typed models and tools, [`graph::BindingGraph::build`] wires them with
//! tape, glue and magnet bindings, and [`engine::Engine`] runs the result.
//! [`Program`] bundles the first three steps.

pub mod dsl;
pub mod engine;
mod error;
pub mod graph;
pub mod program;
pub mod protocol;
pub mod providers;
pub mod registry;
pub mod secret;
pub mod tool;

pub use engine::{Engine, EngineConfig, RetryPolicy, RunError, RunFailure, RunOutput};
pub use error::Error;
pub use program::Program;
pub use providers::{ProviderCatalog, ProviderKind, Providers};
pub use registry::{BuildError, BuildOptions, UnknownProviderPolicy};
