//! Transaction-log synchronizer — narrow interface consumed, never
//! reimplemented. Mirrors `transactionlog::SyncProxy`, the `tlSyncer`
//! constructor parameter of the original `LogDataStore`.

use crate::error::Result;

pub trait TlogSync: Send + Sync {
    /// Blocks until the log has durably recorded every operation with
    /// serial ≤ `serial`.
    fn sync(&self, serial: u64) -> Result<()>;
}

/// No-tlog implementation for tests and standalone use.
pub struct NoopTlogSync;

impl TlogSync for NoopTlogSync {
    fn sync(&self, _serial: u64) -> Result<()> {
        Ok(())
    }
}
