mod credit_repo;
mod generation_task_repo;

pub use credit_repo::{CreditRepo, HistoryFilter};
pub use generation_task_repo::GenerationTaskRepo;
