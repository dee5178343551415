//! # noby-build
//!
//! Layered filesystem image builder.
//!
//! noby builds images from a minimal Dockerfile dialect (`FROM`, `ENV`,
//! `HOST`, `RUN`) on top of copy-on-write snapshots:
//! - Every `HOST`/`RUN` instruction produces a layer addressed by its inputs
//! - Unchanged instructions reuse their cached layer
//! - Tags name final layers; `run` executes commands in throwaway snapshots

#![warn(missing_docs)]

pub mod build;
pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod env;
pub mod exec;
pub mod nobyfile;
pub mod run;

pub use build::{BuildOptions, BuildReport, BuildState, Builder, StepOutcome, StepRecord};
pub use cache::layer_key;
pub use config::EngineConfig;
pub use engine::Engine;
pub use env::EnvSet;
pub use exec::{CommandExecutor, ExecOutput, ExecutionMode, Invocation, ProcessExecutor};
pub use nobyfile::{BuildPlan, Instruction};
pub use run::{RunOutcome, RunService};
