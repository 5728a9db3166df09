//! Blobs split across consecutive events of one process
//!
//! A blob subscription holds one `QueryEvent` registration per clock in its
//! range and reassembles the content in clock order. It reports `None` as
//! soon as any section is deleted and stays silent while sections are still
//! missing.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::{ContentType, Process, PublicKey};
use crate::ranges::RangesForProcess;
use crate::store::EventState;

use super::event::QueryEvent;
use super::subscription::{Callback, Registration, SubscriptionMap};
use super::QueryError;

pub type BlobKey = (PublicKey, Process, RangesForProcess);

#[derive(Default)]
pub(crate) struct BlobSections {
    sections: BTreeMap<u64, EventState>,
}

impl BlobSections {
    /// `None` while incomplete, `Some(None)` if deleted.
    fn assemble(&self, expected: u64) -> Option<Option<Vec<u8>>> {
        let mut out = Vec::new();
        let mut complete = self.sections.len() as u64 == expected;
        for state in self.sections.values() {
            match state {
                EventState::Deleted { .. } => return Some(None),
                EventState::Present(signed) => match signed.decode_trusted() {
                    Ok(event) if event.content_type == ContentType::Delete => return Some(None),
                    Ok(event) => out.extend_from_slice(&event.content),
                    Err(e) => {
                        log::warn!("undecodable blob section: {}", e);
                        return Some(None);
                    }
                },
                EventState::Absent => complete = false,
            }
        }
        complete.then_some(Some(out))
    }
}

#[derive(Clone)]
pub struct QueryBlob {
    map: SubscriptionMap<BlobKey, Option<Vec<u8>>, BlobSections>,
    events: QueryEvent,
}

impl QueryBlob {
    pub fn new(events: QueryEvent) -> Self {
        Self {
            map: SubscriptionMap::new(),
            events,
        }
    }

    pub fn query(
        &self,
        system: PublicKey,
        process: Process,
        ranges: RangesForProcess,
        callback: Callback<Option<Vec<u8>>>,
    ) -> Result<Registration, QueryError> {
        let key = (system.clone(), process, ranges.clone());
        self.map.register(key, callback, |subscription| {
            let expected = ranges.len();
            if expected == 0 {
                subscription.publish(Some(Vec::new()));
                return Vec::new();
            }

            let mut hooks = Vec::new();
            for clock in ranges.clocks() {
                let blob = Arc::downgrade(subscription);
                let section = Callback::new(move |state: &EventState| {
                    let Some(blob) = blob.upgrade() else {
                        return;
                    };
                    blob.update(|latest, sections| {
                        sections.sections.insert(clock, state.clone());
                        let value = sections.assemble(expected)?;
                        if latest.as_ref() == Some(&value) {
                            return None;
                        }
                        *latest = Some(value.clone());
                        Some(value)
                    });
                })
                .with_cancellation(subscription.token().clone());

                match self.events.query(system.clone(), process, clock, section) {
                    Ok(registration) => hooks.push(registration),
                    Err(e) => log::warn!("blob section {} not watched: {}", clock, e),
                }
            }
            hooks
        })
    }

    pub fn is_clean(&self) -> bool {
        self.map.is_clean()
    }
}
