// src/batch/mod.rs

//! Batching of ready tasks.
//!
//! - [`metadata`] defines [`Batch`], [`BatchMetadata`] and [`BatchResult`].
//! - [`accumulator`] groups tasks by type and flushes them by size or timer.

pub mod accumulator;
pub mod metadata;

pub use accumulator::BatchAccumulator;
pub use metadata::{Batch, BatchMetadata, BatchResult};
