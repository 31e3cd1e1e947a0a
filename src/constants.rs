//! Centralized timing, sizing, and error-table constants.
//!
//! Mirrors the layout of the source this was adapted from: magic numbers grouped under
//! banner comments instead of scattered through the modules that use them.

use std::time::Duration;

// ============================================================================
// Session id space
// ============================================================================

/// Highest allocatable session id (inclusive). Ids run 0..=MAX_SESSION_ID.
pub const MAX_SESSION_ID: u16 = 0xfffe;

// ============================================================================
// Mailbox depths
// ============================================================================

pub const DOWN_SESSION_MAILBOX: usize = 64;
pub const UP_SESSION_MAILBOX: usize = 512;
pub const UP_SESSION_MANAGER_MAILBOX: usize = 64;
pub const SESSION_MANAGER_MAILBOX: usize = 64;

// ============================================================================
// Timeouts
// ============================================================================

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_FAKE_JOB_NOTIFY_INTERVAL: Duration = Duration::from_secs(30);

/// Debounce window before a burst of miner disconnects is collapsed into one count update.
pub const MINER_COUNT_DEBOUNCE: Duration = Duration::from_secs(1);

// ============================================================================
// Pool topology defaults
// ============================================================================

pub const DEFAULT_POOL_CONNECTIONS_PER_SUBACCOUNT: u8 = 5;

/// Required extranonce2 width advertised by the pool; anything else aborts the up-session.
pub const REQUIRED_EXTRANONCE2_SIZE: i64 = 4;

/// Submits carrying a version mask after this many consecutive rolled shares reset the
/// AsicBoost-lost counter; one submit missing the mask past this point reconnects the miner.
pub const ASICBOOST_LOST_THRESHOLD: u64 = 100;

pub const DEFAULT_WORKER_NAME: &str = "__default__";
pub const DEFAULT_IP_WORKER_NAME_FORMAT: &str = "{1}x{2}x{3}x{4}";

/// Prefix marking a proxy-minted job id; never produced by a real pool.
pub const FAKE_JOB_ID_PREFIX: &str = "fake-";

// ============================================================================
// Stratum wire error table (RPC-1 `[code, message, data]`)
// ============================================================================

pub struct StratumError {
    pub code: i32,
    pub message: &'static str,
}

pub const ERR_JOB_NOT_FOUND: StratumError = StratumError { code: 21, message: "Job not found (=stale)" };
pub const ERR_NEED_AUTHORIZED: StratumError = StratumError { code: 24, message: "Unauthorized worker" };
pub const ERR_NEED_SUBSCRIBED: StratumError = StratumError { code: 25, message: "Not subscribed" };
pub const ERR_ILLEGAL_PARAMS: StratumError = StratumError { code: 27, message: "Illegal params" };
pub const ERR_TOO_FEW_PARAMS: StratumError = StratumError { code: 27, message: "Too few params" };
pub const ERR_DUPLICATE_SUBSCRIBED: StratumError = StratumError { code: 102, message: "Duplicate Subscribed" };
pub const ERR_WORKER_NAME_NOT_STRING: StratumError =
    StratumError { code: 104, message: "Worker Name Must be a String" };
pub const ERR_SUBACCOUNT_EMPTY: StratumError =
    StratumError { code: 105, message: "Sub-account Name Cannot be Empty" };
