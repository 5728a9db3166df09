//! Range-based synchronization with servers
//!
//! A round compares the ranges each side holds, pushes what the server lacks
//! and pulls what we lack, in bounded batches. Rounds keep no state between
//! them, so an interrupted round is safe to rerun.

pub mod engine;
pub mod memory;

pub use engine::SyncEngine;
pub use memory::{MemoryServer, MemoryTransport};

use async_trait::async_trait;
use thiserror::Error;

use crate::ingest::IngestError;
use crate::model::{PublicKey, SignedEvent};
use crate::ranges::RangesForSystem;
use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Round interrupted after pushing {pushed} and pulling {pulled} events: {cause}")]
    RoundInterrupted {
        pushed: u64,
        pulled: u64,
        rejected: u64,
        cause: String,
    },
}

impl SyncError {
    /// Progress made before the failure, if the round got that far.
    pub fn partial_report(&self) -> Option<RoundReport> {
        match self {
            SyncError::RoundInterrupted {
                pushed,
                pulled,
                rejected,
                ..
            } => Some(RoundReport {
                pushed: *pushed,
                pulled: *pulled,
                rejected: *rejected,
            }),
            _ => None,
        }
    }
}

/// What one round (or a sequence of rounds) achieved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub pushed: u64,
    pub pulled: u64,
    /// Pulled events that failed verification or belonged to another system.
    pub rejected: u64,
}

impl RoundReport {
    pub fn made_progress(&self) -> bool {
        self.pushed > 0 || self.pulled > 0
    }

    pub fn absorb(&mut self, other: &RoundReport) {
        self.pushed += other.pushed;
        self.pulled += other.pulled;
        self.rejected += other.rejected;
    }

    pub(crate) fn interrupted(&self, cause: impl ToString) -> SyncError {
        SyncError::RoundInterrupted {
            pushed: self.pushed,
            pulled: self.pulled,
            rejected: self.rejected,
            cause: cause.to_string(),
        }
    }
}

/// Connection to the servers a system replicates to.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Ranges `server` holds for `system`.
    async fn get_ranges(&self, server: &str, system: &PublicKey) -> Result<RangesForSystem, SyncError>;

    /// Events of `system` inside `ranges`. The server may return fewer than asked.
    async fn get_events(
        &self,
        server: &str,
        system: &PublicKey,
        ranges: &RangesForSystem,
    ) -> Result<Vec<SignedEvent>, SyncError>;

    /// Hand `events` to `server`. Succeeds only if the server kept all of them.
    async fn post_events(&self, server: &str, events: &[SignedEvent]) -> Result<(), SyncError>;
}
