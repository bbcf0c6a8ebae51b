//! Service pair lifecycle management.
//!
//! A start is serialized machine-wide by an advisory file lock, spawns the
//! inference backend and API front-end in their own process groups, waits
//! for both health endpoints, and persists a supervision record. A stop
//! loads the record and walks both process trees through a graceful-then-
//! forceful termination escalation.

mod command;
mod error;
mod health;
mod lock;
mod manager;
mod process;
mod record;

pub use command::{
    CommandPlan, best_practice_path, build_backend_command, family_from_folder,
    plan_backend_command, template_path,
};
pub use error::ServiceError;
pub use health::{HealthOptions, wait_for_health};
pub use lock::StartLock;
pub use manager::{
    DEFAULT_APP_PORT, DEFAULT_CONTEXT_LENGTH, DEFAULT_HOST, MetadataRetry, ServiceManager,
    free_port, port_in_use,
};
pub use process::{PidState, child_pids, pid_alive, probe_pid, spawn_in_group, terminate_tree};
pub use record::{RECORD_VERSION, ServiceRecord};
