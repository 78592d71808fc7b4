pub mod credit;
pub mod generation_task;
pub mod status;
