pub mod cache;
pub mod job;
pub mod quota;
pub mod task;
