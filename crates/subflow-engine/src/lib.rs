// Workflow engine: process service, durable step log, concurrency
// controls and task maintenance.

pub mod config;
pub mod distlock;
pub mod error;
pub mod logstep;
pub mod service;
pub mod tasks;

pub use config::EngineConfig;
pub use distlock::{DistLock, LockGuard, MemoryDistLock};
pub use error::EngineError;
pub use logstep::{BroadcastFn, DbStepLogger, RunHooks, SearchIndexFn, StoreEngineProbe};
pub use service::{Engine, EngineBuilder, EngineStatus, ProcessDetails, SYSTEM_USER};
pub use tasks::{TASK_CLEAN_UP_TASKS, TASK_RESUME_WORKFLOWS};
