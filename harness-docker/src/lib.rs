//! # harness-docker
//!
//! Docker Engine backend for the BlueChi test harness.
//!
//! Containers run the integration test image with systemd as PID 1, so they
//! are created privileged. Commands run through `sh -c` via the exec API and
//! files move in and out as tar archives.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod docker;

pub use docker::DockerBackend;
