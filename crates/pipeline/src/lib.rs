//! Generation pipeline: workflow templates, the engine port, progress
//! routing, the credit ledger, task persistence and the orchestrator that
//! ties them together.

pub mod engine;
pub mod images;
pub mod ledger;
pub mod mock;
pub mod orchestrator;
pub mod progress;
pub mod reconciliation;
pub mod storage;
pub mod tasks;
pub mod template;
