pub mod bg_removal;
pub mod cleanup;
pub mod events;
pub mod heartbeat;
pub mod processor;
pub mod queue;
pub mod quota;
pub mod redact;
pub mod resilience;
pub mod shutdown;
pub mod storage;
pub mod transforms;
pub mod watermark;
pub mod worker_pool;
