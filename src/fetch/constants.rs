//! Constants for the fetch module (sizes, timeouts, backoff).

use std::time::Duration;

/// Streaming write buffer size (4 MiB).
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Bytes written between explicit flush + fsync (50 MiB).
pub const FLUSH_INTERVAL_BYTES: u64 = 50 * 1024 * 1024;

/// Pending bytes accumulated before draining into the main progress counter
/// (10 MiB).
pub const PROGRESS_BATCH_BYTES: u64 = 10 * 1024 * 1024;

/// Maximum concurrent blob downloads.
pub const MAX_CONCURRENT_DOWNLOADS: usize = 16;

/// Minimum concurrency even for tiny manifests.
pub const MIN_CONCURRENT_DOWNLOADS: usize = 4;

/// Shared connection pool size for the blob session.
pub const CONNECTION_POOL_SIZE: usize = 32;

/// Attempts per blob and per whole-model orchestration.
pub const MAX_ATTEMPTS: u32 = 2;

/// Base retry interval; also the flat wait after 401/403/404.
pub const BACKOFF_BASE: Duration = Duration::from_secs(60);

/// Upper bound on the exponential retry interval.
pub const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Whole-request budget for one blob GET.
pub const BLOB_TOTAL_TIMEOUT: Duration = Duration::from_secs(900);

/// TCP connect budget for gateway requests.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Socket read budget between low-level reads.
pub const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Abort a transfer when no chunk arrives for this long.
pub const IDLE_CHUNK_TIMEOUT: Duration = Duration::from_secs(180);

/// Whole-request budget for the manifest GET.
pub const MANIFEST_TOTAL_TIMEOUT: Duration = Duration::from_secs(180);

/// TCP connect budget for the manifest GET.
pub const MANIFEST_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Temp file suffix used before atomic rename.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Suffix of the optional multimodal projector sibling.
pub const PROJECTOR_SUFFIX: &str = "-projector";
