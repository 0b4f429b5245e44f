//! # vdisk Common
//!
//! Shared utilities for the vdisk components.
//!
//! ## Logging
//!
//! ```no_run
//! use vdisk_common::{init_logging, TimedOperation};
//!
//! // Initialize with level
//! init_logging("info").unwrap();
//!
//! let op = TimedOperation::start("allocate volume");
//! // ... do work ...
//! op.finish();
//! ```

pub mod logging;

// Re-export logging functions
pub use logging::{
    init_logging,
    init_logging_json,
    init_logging_with,
    LogFormat,
    TimedOperation,
};
