pub mod config;
pub mod stats;
pub mod supervisor;

pub use self::config::EngineConfig;
pub use self::stats::{Counter, CounterKey, CounterKind};
pub use self::supervisor::{EngineError, EnginePhase, ProcessSupervisor, XraySupervisor};
