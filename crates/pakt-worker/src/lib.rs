//! The privileged side of pakt.
//!
//! The worker reads [`WorkerRequest`](pakt_core::WorkerRequest)s from
//! stdin, runs the job with pacman, and reports back on stdout.

pub mod output;
pub mod plan;
pub mod progress;
pub mod runner;

pub use output::OutputParser;
pub use runner::JobRunner;
