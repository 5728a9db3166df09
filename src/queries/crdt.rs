use std::sync::Arc;

use crate::ingest::{Ingester, Notification};
use crate::model::{ContentType, PublicKey};

use super::subscription::{spawn_computation, Callback, Registration, SubscriptionMap};
use super::QueryError;

pub type CrdtKey = (PublicKey, ContentType);

/// Merged last-writer-wins register of `(system, content_type)`. Delivers
/// `None` until the system has written one.
#[derive(Clone)]
pub struct QueryCrdt {
    map: SubscriptionMap<CrdtKey, Option<Vec<u8>>>,
    ingester: Arc<Ingester>,
}

impl QueryCrdt {
    pub fn new(ingester: Arc<Ingester>) -> Self {
        Self {
            map: SubscriptionMap::new(),
            ingester,
        }
    }

    pub fn query(
        &self,
        system: PublicKey,
        content_type: ContentType,
        callback: Callback<Option<Vec<u8>>>,
    ) -> Result<Registration, QueryError> {
        let key = (system.clone(), content_type);
        self.map.register(key, callback, |subscription| {
            let store = self.ingester.store().clone();
            let watched = system.clone();
            spawn_computation(
                subscription.clone(),
                self.ingester.subscribe(),
                move |n| {
                    matches!(n, Notification::CrdtChanged { system, content_type: ct }
                        if *system == watched && *ct == content_type)
                },
                move || {
                    let store = store.clone();
                    let system = system.clone();
                    async move { store.crdt_value(&system, content_type).await }
                },
            );
            Vec::new()
        })
    }

    pub fn is_clean(&self) -> bool {
        self.map.is_clean()
    }
}
