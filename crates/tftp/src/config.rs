//! Per-transfer tuning knobs.

use std::time::Duration;

use crate::error::TftpError;
use crate::protocol::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

const DEFAULT_BLOCK_SIZE_CAP: u16 = 4096;
const DEFAULT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MAX_RETRIES: u16 = 5;
const DEFAULT_MAX_QUEUE_BYTES: usize = 300 * (1 << 20);

/// How often progress and transfer callbacks fire when the caller does not
/// choose an interval.
pub const DEFAULT_CALLBACK_INTERVAL: Duration = Duration::from_millis(1000);

/// Tuning for one transfer.
///
/// A value of this type is passed explicitly to every entry point;
/// [`TransferConfig::default`] gives the stock tuning. The same value can be
/// shared by any number of concurrent sessions.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Block size to propose (client) or cap peer proposals at (server).
    ///
    /// Smaller is friendlier to small files and lossy links, larger is
    /// faster. Values above 8192 are accepted but known to upset some
    /// kernel socket stacks; 8192 is the recommended maximum.
    pub block_size: u16,

    /// Per-packet receive timeout. Whole seconds on the wire, 1..=255.
    pub timeout: Duration,

    /// How many times to re-send a packet before giving up. The budget
    /// refills whenever the peer makes forward progress.
    pub max_retries: u16,

    /// Upper bound on bytes queued between the disk and network sides of a
    /// parallel transfer. Setting this too low drags transfers down to raw
    /// disk speed.
    pub max_queue_bytes: usize,

    /// Run file reads/writes on a dedicated thread. Only engaged for block
    /// sizes of 2048 and up; below that the per-packet handoff overhead
    /// costs more than it saves.
    pub parallel_io: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE_CAP,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            max_queue_bytes: DEFAULT_MAX_QUEUE_BYTES,
            parallel_io: true,
        }
    }
}

impl TransferConfig {
    /// Block size below which the I/O pipeline runs inline.
    pub(crate) const PARALLEL_IO_THRESHOLD: u16 = 2048;

    /// Reject configurations the protocol cannot express.
    pub(crate) fn validate(&self) -> Result<(), TftpError> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(TftpError::Library(format!(
                "block size {} outside {}..={}",
                self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        if self.timeout_secs() == 0 {
            return Err(TftpError::Library("timeout must be at least 1 second".to_string()));
        }
        if self.max_retries == 0 {
            return Err(TftpError::Library("max_retries must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Timeout as whole wire seconds, clamped to the option's 1..=255 range.
    pub(crate) fn timeout_secs(&self) -> u64 {
        self.timeout.as_secs().min(255)
    }

    /// Whether a session at block size `block_size` runs its disk I/O on a
    /// dedicated thread.
    pub(crate) fn use_parallel_io(&self, block_size: u16) -> bool {
        self.parallel_io && block_size >= Self::PARALLEL_IO_THRESHOLD
    }
}
