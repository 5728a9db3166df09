use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::ingest::{IngestOutcome, Ingester};
use crate::model::{PublicKey, SignedEvent};
use crate::ranges::RangesForSystem;
use crate::store::Store;

use super::{RoundReport, SyncError, Transport};

pub struct SyncEngine {
    store: Store,
    ingester: Arc<Ingester>,
    transport: Arc<dyn Transport>,
    config: SyncConfig,
    default_servers: Vec<String>,
}

impl SyncEngine {
    pub fn new(ingester: Arc<Ingester>, transport: Arc<dyn Transport>, config: SyncConfig) -> Self {
        Self {
            store: ingester.store().clone(),
            ingester,
            transport,
            config,
            default_servers: Vec::new(),
        }
    }

    /// Servers to try for every system on top of what the system lists.
    pub fn with_default_servers(mut self, servers: Vec<String>) -> Self {
        self.default_servers = servers;
        self
    }

    fn batch_size(&self) -> u64 {
        self.config.batch_size.max(1)
    }

    /// One discover, push, pull pass against `server`.
    pub async fn sync_round(&self, server: &str, system: &PublicKey) -> Result<RoundReport, SyncError> {
        let mut report = RoundReport::default();

        let remote = self.transport.get_ranges(server, system).await?;
        // The server just told us what it has.
        self.store.record_server_ack(server, system, &remote).await?;

        let local = self.store.ranges_for_system(system).await?;
        let mut outbound = local.subtract(&remote);
        while !outbound.is_empty() {
            let batch = outbound.take_max_items(self.batch_size());
            let events = self.store.events_in_ranges(system, &batch).await?;
            if let Err(e) = self.transport.post_events(server, &events).await {
                log::warn!("push to {} failed for {}: {}", server, system, e);
                return Err(report.interrupted(e));
            }
            self.store.record_server_ack(server, system, &batch).await?;
            report.pushed += events.len() as u64;
            outbound = outbound.subtract(&batch);
        }

        let local = self.store.ranges_for_system(system).await?;
        let mut inbound = remote.subtract(&local);
        while !inbound.is_empty() {
            let batch = inbound.take_max_items(self.batch_size());
            let events = match self.transport.get_events(server, system, &batch).await {
                Ok(events) => events,
                Err(e) => {
                    log::warn!("pull from {} failed for {}: {}", server, system, e);
                    return Err(report.interrupted(e));
                }
            };
            self.ingest_pulled(server, system, &events, &mut report).await?;
            inbound = inbound.subtract(&batch);
        }

        log::info!(
            "sync round with {} for {}: pushed {}, pulled {}, rejected {}",
            server,
            system,
            report.pushed,
            report.pulled,
            report.rejected
        );
        Ok(report)
    }

    async fn ingest_pulled(
        &self,
        server: &str,
        system: &PublicKey,
        events: &[SignedEvent],
        report: &mut RoundReport,
    ) -> Result<(), SyncError> {
        for signed in events {
            if signed.system() != system {
                log::warn!("{} sent an event of {} while pulling {}", server, signed.system(), system);
                report.rejected += 1;
                continue;
            }
            match self.ingester.ingest(signed).await {
                Ok(IngestOutcome::Stored) => report.pulled += 1,
                Ok(IngestOutcome::Duplicate) => {}
                Err(e) if e.is_permanent() => {
                    log::warn!("rejected event from {} for {}: {}", server, system, e);
                    report.rejected += 1;
                }
                Err(e) => return Err(report.interrupted(e)),
            }
        }
        Ok(())
    }

    /// Run rounds until one makes no progress or `max_rounds` is reached.
    pub async fn backfill(&self, server: &str, system: &PublicKey) -> Result<RoundReport, SyncError> {
        let mut total = RoundReport::default();
        for _ in 0..self.config.max_rounds.max(1) {
            let round = match self.sync_round(server, system).await {
                Ok(round) => round,
                Err(SyncError::RoundInterrupted {
                    pushed,
                    pulled,
                    rejected,
                    cause,
                }) => {
                    // Report progress of earlier rounds too.
                    total.absorb(&RoundReport {
                        pushed,
                        pulled,
                        rejected,
                    });
                    return Err(total.interrupted(cause));
                }
                Err(e) => return Err(e),
            };
            total.absorb(&round);
            if !round.made_progress() {
                return Ok(total);
            }
        }
        log::warn!(
            "backfill with {} for {} did not settle in {} rounds",
            server,
            system,
            self.config.max_rounds
        );
        Ok(total)
    }

    /// Backfill against every server known for `system`. One failing server
    /// does not stop the others.
    pub async fn backfill_all(
        &self,
        system: &PublicKey,
    ) -> Result<BTreeMap<String, Result<RoundReport, SyncError>>, SyncError> {
        let mut servers: BTreeSet<String> = self.store.servers_for_system(system).await?;
        servers.extend(self.default_servers.iter().cloned());

        let mut results = BTreeMap::new();
        for server in servers {
            let result = self.backfill(&server, system).await;
            if let Err(e) = &result {
                log::warn!("backfill with {} for {} failed: {}", server, system, e);
            }
            results.insert(server, result);
        }
        Ok(results)
    }

    /// Ranges `server` is known to hold for `system`, as recorded by past rounds.
    pub async fn acknowledged(&self, server: &str, system: &PublicKey) -> Result<RangesForSystem, SyncError> {
        let local = self.store.ranges_for_system(system).await?;
        let mut acked = RangesForSystem::new();
        for process in local.processes() {
            acked.insert(*process, self.store.server_acks(server, system, process).await?);
        }
        Ok(acked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentType, Event, Identity, Process};
    use crate::ranges::RangesForProcess;
    use crate::storage::MemoryKv;
    use crate::sync::MemoryTransport;

    fn ingester() -> Arc<Ingester> {
        Arc::new(Ingester::new(Store::new(Arc::new(MemoryKv::new())), 64))
    }

    fn post(id: &Identity, process: Process, clock: u64) -> SignedEvent {
        let event = Event::new(
            id.public_key(),
            process,
            clock,
            ContentType::Post,
            format!("post {}", clock).into_bytes(),
        );
        SignedEvent::sign(id, &event).unwrap()
    }

    #[tokio::test]
    async fn test_round_pushes_only_missing_ranges() {
        let id = Identity::generate();
        let process = Process::generate();
        let events: Vec<SignedEvent> = (1..=5).map(|c| post(&id, process, c)).collect();

        let local = ingester();
        local.ingest_all(&events).await.unwrap();

        let transport = Arc::new(MemoryTransport::new(64));
        let server = transport.add_server("srv");
        server.ingester().ingest_all(&events[..3]).await.unwrap();

        let config = SyncConfig {
            batch_size: 10,
            max_rounds: 4,
        };
        let engine = SyncEngine::new(local.clone(), transport.clone(), config);
        let report = engine.sync_round("srv", &id.public_key()).await.unwrap();
        assert_eq!(report.pushed, 2);
        assert_eq!(report.pulled, 0);
        assert_eq!(transport.posted_events("srv"), 2);

        let remote = transport.get_ranges("srv", &id.public_key()).await.unwrap();
        assert_eq!(
            remote.get(&process),
            Some(&RangesForProcess::normalize([(1, 5)]).unwrap())
        );
        let acked = engine.acknowledged("srv", &id.public_key()).await.unwrap();
        assert_eq!(acked, remote);
    }

    #[tokio::test]
    async fn test_pulled_events_from_other_systems_are_rejected() {
        let id = Identity::generate();
        let stranger = Identity::generate();
        let process = Process::generate();

        let transport = Arc::new(MemoryTransport::new(64));
        let server = transport.add_server("srv");
        server.ingester().ingest(&post(&id, process, 1)).await.unwrap();
        transport.inject_on_fetch("srv", post(&stranger, process, 9));

        let local = ingester();
        let engine = SyncEngine::new(local.clone(), transport, SyncConfig::default());
        let report = engine.sync_round("srv", &id.public_key()).await.unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(report.rejected, 1);
        assert!(local
            .store()
            .ranges_for_system(&stranger.public_key())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unknown_server_fails_before_progress() {
        let engine = SyncEngine::new(
            ingester(),
            Arc::new(MemoryTransport::new(64)),
            SyncConfig::default(),
        );
        let err = engine
            .sync_round("nowhere", &Identity::generate().public_key())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TransportError(_)));
        assert_eq!(err.partial_report(), None);
    }
}
