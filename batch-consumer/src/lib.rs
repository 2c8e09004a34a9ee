//! Batch-windowing consumption engine.
//!
//! Items are pulled one at a time from an [`source::ItemSource`], accumulated
//! into windows and handed to a [`handler::BatchHandler`] once a window is
//! full or its timeout elapses, whichever happens first. [`service::BatchService`]
//! owns the process lifecycle: it waits for a termination signal or an explicit
//! stop, then drains every running pipeline.

pub mod batch;
pub mod buffer;
pub mod config;
pub mod error;
pub mod funnel;
pub mod handler;
pub mod kafka;
pub mod lifecycle;
pub mod metrics_consts;
pub mod pipeline;
pub mod service;
pub mod shutdown;
pub mod source;
pub mod windower;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;
