//! Compile-time configuration constants.

use std::time::Duration;

/// Highest RPC endpoint ID. The hook registry holds `MAX_RPC_ID + 1` slots.
pub const MAX_RPC_ID: u8 = 255;

/// Maximum number of background request-processing threads.
pub const MAX_BG_THREADS: usize = 8;

/// Number of request types; the handler table is indexed by `u8`.
pub const MAX_REQ_TYPES: usize = 256;

/// CPU core the session-management thread is pinned to, when present.
pub const SM_THREAD_CORE: usize = 15;

/// Upper bound on one SM event-loop iteration's blocking wait.
pub const SM_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on a background worker's blocking wait between
/// kill-switch checks.
pub const BG_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Width of the hostname field in SM endpoint metadata (NUL-padded).
pub const MAX_HOSTNAME_LEN: usize = 64;

/// Session number carried in SM packets before one has been assigned.
pub const INVALID_SESSION_NUM: u16 = u16::MAX;
