// src/watch/mod.rs

//! File watching and change detection.
//!
//! This module is responsible for:
//! - Compiling include/exclude globs and the module pattern (`patterns.rs`).
//! - Wiring up a cross-platform filesystem watcher (`notify`).
//! - Hashing file contents to drop no-op notifications (`hash.rs`).
//! - Decomposing a change event into graph fragments (`decompose.rs`).
//!
//! It does not know about the DAG or the worker pool; it only turns
//! filesystem changes into [`crate::types::ChangeEvent`]s.

pub mod decompose;
pub mod hash;
pub mod patterns;
pub mod watcher;

pub use decompose::{file_entity_id, module_entity_id, FileDecomposer};
pub use hash::{hash_file, ContentCache};
pub use patterns::{ModuleResolver, PathFilter, WatchRules};
pub use watcher::{spawn_watcher, ChangeDetector, WatcherHandle};
