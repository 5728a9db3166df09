use std::collections::BTreeSet;
use std::sync::Arc;

use crate::ingest::{Ingester, Notification};
use crate::model::{ContentType, PublicKey};

use super::subscription::{spawn_computation, Callback, Registration, SubscriptionMap};
use super::QueryError;

/// Servers known for a system: local address hints plus its own server list.
#[derive(Clone)]
pub struct QueryServers {
    map: SubscriptionMap<PublicKey, BTreeSet<String>>,
    ingester: Arc<Ingester>,
}

impl QueryServers {
    pub fn new(ingester: Arc<Ingester>) -> Self {
        Self {
            map: SubscriptionMap::new(),
            ingester,
        }
    }

    pub fn query(
        &self,
        system: PublicKey,
        callback: Callback<BTreeSet<String>>,
    ) -> Result<Registration, QueryError> {
        self.map.register(system.clone(), callback, |subscription| {
            let store = self.ingester.store().clone();
            let watched = system.clone();
            spawn_computation(
                subscription.clone(),
                self.ingester.subscribe(),
                move |n| match n {
                    Notification::HintsChanged { system } => *system == watched,
                    Notification::CrdtChanged {
                        system,
                        content_type: ContentType::Server,
                    } => *system == watched,
                    _ => false,
                },
                move || {
                    let store = store.clone();
                    let system = system.clone();
                    async move { store.servers_for_system(&system).await }
                },
            );
            Vec::new()
        })
    }

    /// Remember that `server` may hold data for `system`.
    pub async fn add_address_hint(&self, system: &PublicKey, server: &str) -> Result<(), QueryError> {
        self.ingester.store().put_address_hint(system, server).await?;
        self.ingester.publish(Notification::HintsChanged {
            system: system.clone(),
        });
        Ok(())
    }

    pub fn is_clean(&self) -> bool {
        self.map.is_clean()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;
    use crate::store::Store;
    use crate::model::Identity;

    #[tokio::test]
    async fn test_hint_updates_subscribers() {
        let ingester = Arc::new(Ingester::new(Store::new(Arc::new(MemoryKv::new())), 64));
        let servers = QueryServers::new(ingester);
        let system = Identity::generate().public_key();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let reg = servers
            .query(
                system.clone(),
                Callback::new(move |set: &BTreeSet<String>| {
                    let _ = tx.send(set.clone());
                }),
            )
            .unwrap();
        assert!(rx.recv().await.unwrap().is_empty());

        servers.add_address_hint(&system, "https://a.example").await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            BTreeSet::from(["https://a.example".to_string()])
        );

        reg.unregister();
        assert!(servers.is_clean());
    }
}
