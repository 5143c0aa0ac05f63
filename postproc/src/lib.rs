//! postproc library crate.
//!
//! A post-processing engine for captured recordings: external process jobs,
//! resumable stream transfers and a dual-lane (heavy/light) work queue that
//! dispatches recordings to registered workers.

pub mod config;
pub mod domain;
pub mod error;
pub mod job;
pub mod logging;
pub mod nms;
pub mod postproc;
pub mod transfer;
pub mod worker;

pub use error::{Error, Result};
