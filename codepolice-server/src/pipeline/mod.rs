//! The analyze-and-fix pipeline, one module per stage.

pub mod analyzer;
pub mod monitor;
pub mod notifier;
pub mod orchestrator;
pub mod planner;
pub mod publisher;
