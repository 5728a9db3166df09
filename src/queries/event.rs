use std::sync::Arc;

use crate::ingest::Ingester;
use crate::model::{Process, PublicKey};
use crate::store::EventState;

use super::subscription::{spawn_computation, Callback, Registration, SubscriptionMap};
use super::QueryError;

pub type EventKey = (PublicKey, Process, u64);

/// One event location. Follows arrival and deletion of the event.
#[derive(Clone)]
pub struct QueryEvent {
    map: SubscriptionMap<EventKey, EventState>,
    ingester: Arc<Ingester>,
}

impl QueryEvent {
    pub fn new(ingester: Arc<Ingester>) -> Self {
        Self {
            map: SubscriptionMap::new(),
            ingester,
        }
    }

    pub fn query(
        &self,
        system: PublicKey,
        process: Process,
        logical_clock: u64,
        callback: Callback<EventState>,
    ) -> Result<Registration, QueryError> {
        let key = (system.clone(), process, logical_clock);
        self.map.register(key, callback, |subscription| {
            let store = self.ingester.store().clone();
            let watched = system.clone();
            spawn_computation(
                subscription.clone(),
                self.ingester.subscribe(),
                move |n| *n.system() == watched && n.touches(&process, logical_clock),
                move || {
                    let store = store.clone();
                    let system = system.clone();
                    async move { store.event_state(&system, &process, logical_clock).await }
                },
            );
            Vec::new()
        })
    }

    pub fn is_clean(&self) -> bool {
        self.map.is_clean()
    }
}
