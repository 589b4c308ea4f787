//! Stagehand Library
//!
//! Keeps an installed application on the newest build published on a feed page, and
//! keeps the updater itself current.

pub mod commands;
pub mod core;
pub mod error;
pub mod utils;

pub use crate::core::config::Config;
pub use crate::core::pipeline::{PipelineState, UpdateCheck, UpdateOrchestrator};
pub use crate::core::self_update::SelfUpdater;
pub use crate::error::{Result, UpdateError};
