pub mod auth;
pub mod bridge;
pub mod circuit_breaker;
pub mod compute;
pub mod coordinator;
pub mod dispatcher;
pub mod job_store;
pub mod periodic;
pub mod queue;
pub mod quota;
pub mod result_cache;
pub mod sweeper;
