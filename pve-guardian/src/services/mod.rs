pub mod backup_engine;
pub mod coordinator;
pub mod host;
pub mod notifier;
pub mod restore_engine;
pub mod retention;
pub mod scheduler;
