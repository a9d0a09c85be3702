//! Single-slot admission for backup and restore tasks.
//!
//! At most one task runs at a time. Nothing waits for the slot: a trigger
//! that finds it taken is rejected on the spot, and a backup is never
//! admitted while a restore runs. The slot also carries the live activity
//! strings shown on the status page.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Idle,
    BackupRunning,
    RestoreRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    #[error("backup already running")]
    BackupRunning,

    #[error("restore in progress, restore has priority")]
    RestoreRunning,

    #[error("service is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Backup,
    Restore,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastBackup {
    pub filename: String,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Activity {
    pub state: SlotState,
    pub backup: String,
    pub restore: String,
    pub last_backup: Option<LastBackup>,
}

const IDLE: &str = "idle";

struct Slot {
    state: SlotState,
    shutting_down: bool,
}

struct Board {
    backup: String,
    restore: String,
    last_backup: Option<LastBackup>,
}

pub struct TaskCoordinator {
    slot: Mutex<Slot>,
    idle: Condvar,
    board: RwLock<Board>,
}

impl Default for TaskCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskCoordinator {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                state: SlotState::Idle,
                shutting_down: false,
            }),
            idle: Condvar::new(),
            board: RwLock::new(Board {
                backup: IDLE.to_string(),
                restore: IDLE.to_string(),
                last_backup: None,
            }),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admission(slot: &Slot) -> Result<(), Rejection> {
        if slot.shutting_down {
            return Err(Rejection::ShuttingDown);
        }
        match slot.state {
            SlotState::Idle => Ok(()),
            SlotState::BackupRunning => Err(Rejection::BackupRunning),
            SlotState::RestoreRunning => Err(Rejection::RestoreRunning),
        }
    }

    /// Whether a task would be admitted right now. Advisory only.
    pub fn check_admission(&self) -> Result<(), Rejection> {
        Self::admission(&self.lock_slot())
    }

    fn try_begin(&self, kind: TaskKind) -> Result<TaskGuard<'_>, Rejection> {
        let mut slot = self.lock_slot();
        Self::admission(&slot)?;
        slot.state = match kind {
            TaskKind::Backup => SlotState::BackupRunning,
            TaskKind::Restore => SlotState::RestoreRunning,
        };
        drop(slot);
        Ok(TaskGuard {
            coordinator: self,
            kind,
        })
    }

    pub fn try_begin_backup(&self) -> Result<TaskGuard<'_>, Rejection> {
        self.try_begin(TaskKind::Backup)
    }

    pub fn try_begin_restore(&self) -> Result<TaskGuard<'_>, Rejection> {
        self.try_begin(TaskKind::Restore)
    }

    pub fn state(&self) -> SlotState {
        self.lock_slot().state
    }

    /// Refuse new tasks and wait up to `timeout` for the running one.
    /// Returns `true` once the slot is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let mut slot = self.lock_slot();
        slot.shutting_down = true;
        let (slot, _) = self
            .idle
            .wait_timeout_while(slot, timeout, |s| s.state != SlotState::Idle)
            .unwrap_or_else(PoisonError::into_inner);
        let idle = slot.state == SlotState::Idle;
        drop(slot);

        let mut board = self.board.write().unwrap_or_else(PoisonError::into_inner);
        board.backup = IDLE.to_string();
        board.restore = IDLE.to_string();
        idle
    }

    pub fn set_backup_activity(&self, activity: impl Into<String>) {
        self.board.write().unwrap_or_else(PoisonError::into_inner).backup = activity.into();
    }

    pub fn set_restore_activity(&self, activity: impl Into<String>) {
        self.board.write().unwrap_or_else(PoisonError::into_inner).restore = activity.into();
    }

    pub fn record_backup_success(&self, filename: impl Into<String>) {
        self.board.write().unwrap_or_else(PoisonError::into_inner).last_backup = Some(LastBackup {
            filename: filename.into(),
            finished_at: Utc::now(),
        });
    }

    pub fn activity(&self) -> Activity {
        let state = self.state();
        let board = self.board.read().unwrap_or_else(PoisonError::into_inner);
        Activity {
            state,
            backup: board.backup.clone(),
            restore: board.restore.clone(),
            last_backup: board.last_backup.clone(),
        }
    }
}

/// Holds the slot; dropping it frees the slot on every exit path.
pub struct TaskGuard<'a> {
    coordinator: &'a TaskCoordinator,
    kind: TaskKind,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        match self.kind {
            TaskKind::Backup => self.coordinator.set_backup_activity(IDLE),
            TaskKind::Restore => self.coordinator.set_restore_activity(IDLE),
        }
        let mut slot = self.coordinator.lock_slot();
        slot.state = SlotState::Idle;
        drop(slot);
        self.coordinator.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_backup_rejected_while_backup_runs() {
        let coordinator = TaskCoordinator::new();
        let guard = coordinator.try_begin_backup().unwrap();
        assert_eq!(coordinator.state(), SlotState::BackupRunning);
        assert_eq!(coordinator.try_begin_backup().err(), Some(Rejection::BackupRunning));
        drop(guard);
        assert_eq!(coordinator.state(), SlotState::Idle);
        assert!(coordinator.try_begin_backup().is_ok());
    }

    #[test]
    fn test_restore_has_priority_over_backup() {
        let coordinator = TaskCoordinator::new();
        let _restore = coordinator.try_begin_restore().unwrap();
        assert_eq!(coordinator.try_begin_backup().err(), Some(Rejection::RestoreRunning));
        assert_eq!(coordinator.try_begin_restore().err(), Some(Rejection::RestoreRunning));
    }

    #[test]
    fn test_restore_rejected_while_backup_runs() {
        let coordinator = TaskCoordinator::new();
        let _backup = coordinator.try_begin_backup().unwrap();
        assert_eq!(coordinator.try_begin_restore().err(), Some(Rejection::BackupRunning));
    }

    #[test]
    fn test_concurrent_triggers_admit_exactly_one() {
        let coordinator = Arc::new(TaskCoordinator::new());
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    match coordinator.try_begin_backup() {
                        Ok(_guard) => {
                            thread::sleep(Duration::from_millis(50));
                            true
                        }
                        Err(_) => false,
                    }
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_guard_resets_activity() {
        let coordinator = TaskCoordinator::new();
        {
            let _guard = coordinator.try_begin_backup().unwrap();
            coordinator.set_backup_activity("downloading 40%");
            assert_eq!(coordinator.activity().backup, "downloading 40%");
        }
        let activity = coordinator.activity();
        assert_eq!(activity.backup, "idle");
        assert_eq!(activity.state, SlotState::Idle);
    }

    #[test]
    fn test_shutdown_waits_for_running_task() {
        let coordinator = Arc::new(TaskCoordinator::new());
        let worker = {
            let coordinator = coordinator.clone();
            thread::spawn(move || {
                let _guard = coordinator.try_begin_restore().unwrap();
                thread::sleep(Duration::from_millis(100));
            })
        };
        while coordinator.state() == SlotState::Idle {
            thread::yield_now();
        }

        assert!(coordinator.wait_idle(Duration::from_secs(5)));
        assert_eq!(coordinator.try_begin_backup().err(), Some(Rejection::ShuttingDown));
        worker.join().unwrap();
    }

    #[test]
    fn test_shutdown_times_out() {
        let coordinator = TaskCoordinator::new();
        let _guard = coordinator.try_begin_backup().unwrap();
        assert!(!coordinator.wait_idle(Duration::from_millis(20)));
    }
}
