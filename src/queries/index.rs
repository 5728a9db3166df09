//! Paginated live index of a system's events of one content type
//!
//! Subscribers see the index through a window that starts empty and grows
//! with `advance`. Changes inside the window are delivered as deltas; events
//! beyond it are left for a later `advance`. Every subscriber of a key shares
//! the same window.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;

use crate::ingest::{Ingester, Notification};
use crate::model::{ContentType, Pointer, Process, PublicKey, SignedEvent};
use crate::store::{EventState, Store, StoreError};

use super::subscription::{Callback, Registration, Subscription, SubscriptionMap};
use super::QueryError;

pub type IndexKey = (PublicKey, ContentType);

/// Position of a cell: newest clock first, then process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CellKey {
    pub logical_clock: u64,
    pub process: Process,
}

impl Ord for CellKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .logical_clock
            .cmp(&self.logical_clock)
            .then_with(|| self.process.cmp(&other.process))
    }
}

impl PartialOrd for CellKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One index entry. A placeholder has no event: it was deleted, or a delete
/// announced it before the event itself arrived.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    pub key: CellKey,
    pub pointer: Option<Pointer>,
    pub signed_event: Option<SignedEvent>,
}

impl Cell {
    fn placeholder(key: CellKey) -> Self {
        Self {
            key,
            pointer: None,
            signed_event: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.signed_event.is_none()
    }
}

/// Change to an index window. Apply `remove` before `add`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexDelta {
    pub add: Vec<Cell>,
    pub remove: Vec<CellKey>,
}

impl IndexDelta {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Ordered list built by folding deltas.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexView {
    cells: BTreeMap<CellKey, Cell>,
}

impl IndexView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, delta: &IndexDelta) {
        for key in &delta.remove {
            self.cells.remove(key);
        }
        for cell in &delta.add {
            self.cells.insert(cell.key, cell.clone());
        }
    }

    pub fn get(&self, key: &CellKey) -> Option<&Cell> {
        self.cells.get(key)
    }

    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    /// Materialized events in order.
    pub fn events(&self) -> impl Iterator<Item = &SignedEvent> {
        self.cells.values().filter_map(|c| c.signed_event.as_ref())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The whole view as one delta, for late joiners.
    fn snapshot(&self) -> IndexDelta {
        IndexDelta {
            add: self.cells.values().cloned().collect(),
            remove: Vec::new(),
        }
    }
}

#[derive(Default)]
pub(crate) struct IndexCursor {
    /// Index key of the last loaded row.
    after: Option<Vec<u8>>,
    last: Option<CellKey>,
    exhausted: bool,
    view: IndexView,
    /// Held by `advance` and by live updates so they never interleave.
    advancing: Arc<tokio::sync::Mutex<()>>,
}

impl IndexCursor {
    fn in_window(&self, key: &CellKey) -> bool {
        self.exhausted || self.last.is_some_and(|last| *key <= last)
    }

    /// Fold freshly loaded cells into the view, drop the `gone` keys and
    /// return what changed.
    fn merge(&mut self, cells: Vec<Cell>, gone: Vec<CellKey>) -> Option<IndexDelta> {
        let mut delta = IndexDelta::default();
        for key in gone {
            if self.view.get(&key).is_some() {
                delta.remove.push(key);
            }
        }
        for cell in cells {
            match self.view.get(&cell.key) {
                Some(existing) if *existing == cell => {}
                Some(_) => {
                    delta.remove.push(cell.key);
                    delta.add.push(cell);
                }
                None => delta.add.push(cell),
            }
        }
        if delta.is_empty() {
            return None;
        }
        self.view.apply(&delta);
        Some(delta)
    }
}

type IndexSubscription = Subscription<IndexDelta, IndexCursor>;

async fn load_cell(store: &Store, system: &PublicKey, key: CellKey) -> Result<Cell, StoreError> {
    Ok(
        match store.event_state(system, &key.process, key.logical_clock).await? {
            EventState::Present(signed) => match signed.to_pointer() {
                Ok(pointer) => Cell {
                    key,
                    pointer: Some(pointer),
                    signed_event: Some(signed),
                },
                Err(_) => Cell::placeholder(key),
            },
            EventState::Deleted { .. } | EventState::Absent => Cell::placeholder(key),
        },
    )
}

#[derive(Clone)]
pub struct QueryIndex {
    map: SubscriptionMap<IndexKey, IndexDelta, IndexCursor>,
    ingester: Arc<Ingester>,
    default_page_size: usize,
}

impl QueryIndex {
    pub fn new(ingester: Arc<Ingester>, default_page_size: usize) -> Self {
        Self {
            map: SubscriptionMap::new(),
            ingester,
            default_page_size: default_page_size.max(1),
        }
    }

    /// Subscribe to the index of `(system, content_type)`. Nothing is loaded
    /// until someone calls `advance`.
    pub fn query(
        &self,
        system: PublicKey,
        content_type: ContentType,
        callback: Callback<IndexDelta>,
    ) -> Result<Registration, QueryError> {
        let key = (system, content_type);
        self.map.register(key.clone(), callback, |subscription| {
            let rx = self.ingester.subscribe();
            let follower = Follower {
                subscription: subscription.clone(),
                store: self.ingester.store().clone(),
                key,
                page_size: self.default_page_size,
            };
            tokio::spawn(follower.run(rx));
            Vec::new()
        })
    }

    /// Load up to `count` more cells (the default page size if zero), deliver
    /// them to every subscriber of the key and return them.
    pub async fn advance(
        &self,
        system: &PublicKey,
        content_type: ContentType,
        callback: &Callback<IndexDelta>,
        count: usize,
    ) -> Result<Vec<Cell>, QueryError> {
        let key = (system.clone(), content_type);
        let subscription = self.map.get(&key).ok_or(QueryError::NotRegistered)?;
        if !subscription.has_callback(callback) {
            return Err(QueryError::NotRegistered);
        }
        let count = if count == 0 { self.default_page_size } else { count };

        let advancing = subscription.inspect(|_, cursor| cursor.advancing.clone());
        let _guard = advancing.lock().await;
        let (after, exhausted) = subscription.inspect(|_, cursor| (cursor.after.clone(), cursor.exhausted));
        if exhausted {
            return Ok(Vec::new());
        }

        let store = self.ingester.store();
        let rows = store
            .events_by_content_type(system, content_type, after.as_deref(), count)
            .await?;
        let reached_end = rows.len() < count;
        let mut cells = Vec::with_capacity(rows.len());
        let mut last = None;
        for (index_key, entry) in rows {
            let cell_key = CellKey {
                logical_clock: entry.logical_clock,
                process: entry.process,
            };
            cells.push(load_cell(store, system, cell_key).await?);
            last = Some((index_key, cell_key));
        }

        let loaded = cells.clone();
        subscription.update(|latest, cursor| {
            if let Some((index_key, cell_key)) = last {
                cursor.after = Some(index_key);
                cursor.last = Some(cell_key);
            }
            cursor.exhausted |= reached_end;
            let delta = cursor.merge(cells, Vec::new());
            *latest = Some(cursor.view.snapshot());
            delta
        });
        log::debug!("advanced {:?} by {} cells", content_type, loaded.len());
        Ok(loaded)
    }

    pub fn is_clean(&self) -> bool {
        self.map.is_clean()
    }
}

/// Applies ingest notifications to one index window.
struct Follower {
    subscription: Arc<IndexSubscription>,
    store: Store,
    key: IndexKey,
    page_size: usize,
}

impl Follower {
    async fn run(self, mut rx: tokio::sync::broadcast::Receiver<Notification>) {
        let token = self.subscription.token().clone();
        loop {
            let result = tokio::select! {
                _ = token.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(notification) => match self.relevant(&notification) {
                        Some(cell_key) => self.refresh(cell_key).await,
                        None => Ok(()),
                    },
                    Err(RecvError::Lagged(_)) => self.resync().await,
                    Err(RecvError::Closed) => break,
                },
            };
            if let Err(e) = result {
                log::warn!("index {:?} update failed: {}", self.key.1, e);
            }
        }
    }

    fn relevant(&self, notification: &Notification) -> Option<CellKey> {
        let (system, content_type) = &self.key;
        match notification {
            Notification::EventStored {
                system: s,
                process,
                logical_clock,
                content_type: ct,
            }
            | Notification::Tombstoned {
                system: s,
                process,
                logical_clock,
                content_type: ct,
            } if s == system && ct == content_type => Some(CellKey {
                logical_clock: *logical_clock,
                process: *process,
            }),
            _ => None,
        }
    }

    async fn refresh(&self, cell_key: CellKey) -> Result<(), StoreError> {
        let advancing = self.subscription.inspect(|_, cursor| cursor.advancing.clone());
        let _guard = advancing.lock().await;
        if !self.subscription.inspect(|_, cursor| cursor.in_window(&cell_key)) {
            return Ok(());
        }
        let (system, content_type) = &self.key;
        let indexed = self
            .store
            .index_entry(system, *content_type, &cell_key.process, cell_key.logical_clock)
            .await?;
        if indexed.is_none() {
            // A placeholder announced under this type was dropped.
            self.apply(Vec::new(), |_| vec![cell_key]);
            return Ok(());
        }
        let cell = load_cell(&self.store, system, cell_key).await?;
        self.apply(vec![cell], |_| Vec::new());
        Ok(())
    }

    /// Reload the whole window after missing notifications.
    async fn resync(&self) -> Result<(), StoreError> {
        let advancing = self.subscription.inspect(|_, cursor| cursor.advancing.clone());
        let _guard = advancing.lock().await;
        let (system, content_type) = &self.key;

        let mut cells = Vec::new();
        let mut after: Option<Vec<u8>> = None;
        'pages: loop {
            let rows = self
                .store
                .events_by_content_type(system, *content_type, after.as_deref(), self.page_size)
                .await?;
            let reached_end = rows.len() < self.page_size;
            for (index_key, entry) in rows {
                let cell_key = CellKey {
                    logical_clock: entry.logical_clock,
                    process: entry.process,
                };
                if !self.subscription.inspect(|_, cursor| cursor.in_window(&cell_key)) {
                    break 'pages;
                }
                cells.push(load_cell(&self.store, system, cell_key).await?);
                after = Some(index_key);
            }
            if reached_end {
                break;
            }
        }
        let loaded: BTreeSet<CellKey> = cells.iter().map(|c| c.key).collect();
        self.apply(cells, |view| {
            view.cells()
                .map(|c| c.key)
                .filter(|key| !loaded.contains(key))
                .collect()
        });
        Ok(())
    }

    /// Merge `cells` and remove the keys `gone` picks from the current view.
    fn apply(&self, cells: Vec<Cell>, gone: impl FnOnce(&IndexView) -> Vec<CellKey>) {
        if self.subscription.token().is_cancelled() {
            return;
        }
        self.subscription.update(|latest, cursor| {
            let gone = gone(&cursor.view);
            let delta = cursor.merge(cells, gone)?;
            *latest = Some(cursor.view.snapshot());
            Some(delta)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(clock: u64, process: u8) -> CellKey {
        CellKey {
            logical_clock: clock,
            process: Process::from_bytes([process; 16]),
        }
    }

    #[test]
    fn test_cell_order_is_clock_desc_then_process() {
        let mut keys = vec![key(1, 1), key(3, 2), key(3, 1), key(2, 9)];
        keys.sort();
        assert_eq!(keys, vec![key(3, 1), key(3, 2), key(2, 9), key(1, 1)]);
    }

    #[test]
    fn test_view_folds_replacements() {
        let mut view = IndexView::new();
        view.apply(&IndexDelta {
            add: vec![Cell::placeholder(key(1, 1)), Cell::placeholder(key(2, 1))],
            remove: Vec::new(),
        });
        view.apply(&IndexDelta {
            add: vec![Cell::placeholder(key(1, 1))],
            remove: vec![key(1, 1), key(2, 1)],
        });
        let keys: Vec<CellKey> = view.cells().map(|c| c.key).collect();
        assert_eq!(keys, vec![key(1, 1)]);
    }

    #[test]
    fn test_cursor_merge_reports_only_changes() {
        let mut cursor = IndexCursor::default();
        let first = cursor.merge(vec![Cell::placeholder(key(1, 1))], Vec::new()).unwrap();
        assert_eq!(first.add.len(), 1);
        assert!(first.remove.is_empty());
        assert!(cursor.merge(vec![Cell::placeholder(key(1, 1))], Vec::new()).is_none());

        // Removing a key the view never held is not a change.
        assert!(cursor.merge(Vec::new(), vec![key(9, 9)]).is_none());
        let gone = cursor.merge(Vec::new(), vec![key(1, 1)]).unwrap();
        assert_eq!(gone.remove, vec![key(1, 1)]);
        assert!(cursor.view.is_empty());
    }

    #[test]
    fn test_window_grows_with_cursor() {
        let mut cursor = IndexCursor::default();
        assert!(!cursor.in_window(&key(5, 1)));
        cursor.last = Some(key(3, 1));
        assert!(cursor.in_window(&key(5, 1)));
        assert!(cursor.in_window(&key(3, 1)));
        assert!(!cursor.in_window(&key(2, 1)));
        cursor.exhausted = true;
        assert!(cursor.in_window(&key(2, 1)));
    }
}
