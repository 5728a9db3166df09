//! In-process servers
//!
//! Each simulated server is a full replica with its own store and ingest
//! pipeline. Used for integration testing without a network. Request budgets
//! let tests cut a server off part way through a round.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::ingest::Ingester;
use crate::model::{PublicKey, SignedEvent};
use crate::ranges::RangesForSystem;
use crate::storage::MemoryKv;
use crate::store::Store;

use super::{SyncError, Transport};

/// A simulated server replica.
pub struct MemoryServer {
    ingester: Ingester,
}

impl MemoryServer {
    pub fn new(notification_capacity: usize) -> Self {
        let store = Store::new(Arc::new(MemoryKv::new()));
        Self {
            ingester: Ingester::new(store, notification_capacity),
        }
    }

    pub fn store(&self) -> &Store {
        self.ingester.store()
    }

    pub fn ingester(&self) -> &Ingester {
        &self.ingester
    }
}

#[derive(Default)]
struct Faults {
    /// Successful posts left before every post fails. `None` is unlimited.
    post_budget: Option<usize>,
    fetch_budget: Option<usize>,
    /// Extra events appended to the next fetch from a server.
    injected: HashMap<String, Vec<SignedEvent>>,
    posted: HashMap<String, u64>,
}

/// A set of named in-process servers.
pub struct MemoryTransport {
    servers: Mutex<HashMap<String, Arc<MemoryServer>>>,
    faults: Mutex<Faults>,
    notification_capacity: usize,
}

fn spend(budget: &mut Option<usize>) -> bool {
    match budget {
        None => true,
        Some(0) => false,
        Some(left) => {
            *left -= 1;
            true
        }
    }
}

impl MemoryTransport {
    pub fn new(notification_capacity: usize) -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            notification_capacity,
        }
    }

    /// Create the server `name`, or return it if it already exists.
    pub fn add_server(&self, name: &str) -> Arc<MemoryServer> {
        let mut servers = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
        servers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryServer::new(self.notification_capacity)))
            .clone()
    }

    pub fn server(&self, name: &str) -> Option<Arc<MemoryServer>> {
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Allow `budget` more successful posts, then fail every post. `None` lifts the limit.
    pub fn limit_posts(&self, budget: Option<usize>) {
        self.faults().post_budget = budget;
    }

    /// Allow `budget` more successful fetches, then fail every fetch. `None` lifts the limit.
    pub fn limit_fetches(&self, budget: Option<usize>) {
        self.faults().fetch_budget = budget;
    }

    /// Append `event` to the next `get_events` answer from `server`.
    pub fn inject_on_fetch(&self, server: &str, event: SignedEvent) {
        self.faults()
            .injected
            .entry(server.to_string())
            .or_default()
            .push(event);
    }

    /// Events accepted by `server` through `post_events`.
    pub fn posted_events(&self, server: &str) -> u64 {
        self.faults().posted.get(server).copied().unwrap_or(0)
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, server: &str) -> Result<Arc<MemoryServer>, SyncError> {
        self.server(server)
            .ok_or_else(|| SyncError::TransportError(format!("unknown server {}", server)))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn get_ranges(&self, server: &str, system: &PublicKey) -> Result<RangesForSystem, SyncError> {
        let replica = self.lookup(server)?;
        replica
            .store()
            .ranges_for_system(system)
            .await
            .map_err(|e| SyncError::TransportError(e.to_string()))
    }

    async fn get_events(
        &self,
        server: &str,
        system: &PublicKey,
        ranges: &RangesForSystem,
    ) -> Result<Vec<SignedEvent>, SyncError> {
        let replica = self.lookup(server)?;
        let injected = {
            let mut faults = self.faults();
            if !spend(&mut faults.fetch_budget) {
                return Err(SyncError::TransportError(format!("{} is unreachable", server)));
            }
            faults.injected.remove(server).unwrap_or_default()
        };
        let mut events = replica
            .store()
            .events_in_ranges(system, ranges)
            .await
            .map_err(|e| SyncError::TransportError(e.to_string()))?;
        events.extend(injected);
        Ok(events)
    }

    async fn post_events(&self, server: &str, events: &[SignedEvent]) -> Result<(), SyncError> {
        let replica = self.lookup(server)?;
        if !spend(&mut self.faults().post_budget) {
            return Err(SyncError::TransportError(format!("{} is unreachable", server)));
        }
        for signed in events {
            replica
                .ingester()
                .ingest(signed)
                .await
                .map_err(|e| SyncError::TransportError(format!("{} rejected event: {}", server, e)))?;
        }
        *self.faults().posted.entry(server.to_string()).or_default() += events.len() as u64;
        Ok(())
    }
}
