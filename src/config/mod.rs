//! Configuration Management Module
//!
//! Tunables for the pool, queue, recovery monitor and tunnel manager, plus
//! their JSON storage.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_file, hosts_file, ConfigStorage, StorageError};
pub use types::{
    EngineAccessConfig, PoolConfig, QueueConfig, RecoveryConfig, TunnelConfig, CONFIG_VERSION,
};
