//! Events and their content types

use serde::{Deserialize, Serialize};

use super::keys::{Process, PublicKey};
use super::signed::Pointer;

/// Content-type tag of an event.
///
/// Reserved and well-known tags get their own variant; anything else is
/// carried through untouched as `Opaque`. Equality, ordering and hashing go
/// through the wire tag, so `Opaque(5)` and `Username` are the same key.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(from = "u64", into = "u64")]
pub enum ContentType {
    Delete,
    SystemProcesses,
    Post,
    Follow,
    Username,
    Description,
    BlobMeta,
    BlobSection,
    Avatar,
    Server,
    Vouch,
    Claim,
    Block,
    Banner,
    Opaque(u64),
}

impl From<u64> for ContentType {
    fn from(tag: u64) -> Self {
        match tag {
            1 => ContentType::Delete,
            2 => ContentType::SystemProcesses,
            3 => ContentType::Post,
            4 => ContentType::Follow,
            5 => ContentType::Username,
            6 => ContentType::Description,
            7 => ContentType::BlobMeta,
            8 => ContentType::BlobSection,
            9 => ContentType::Avatar,
            10 => ContentType::Server,
            11 => ContentType::Vouch,
            12 => ContentType::Claim,
            13 => ContentType::Block,
            14 => ContentType::Banner,
            other => ContentType::Opaque(other),
        }
    }
}

impl From<ContentType> for u64 {
    fn from(content_type: ContentType) -> Self {
        match content_type {
            ContentType::Delete => 1,
            ContentType::SystemProcesses => 2,
            ContentType::Post => 3,
            ContentType::Follow => 4,
            ContentType::Username => 5,
            ContentType::Description => 6,
            ContentType::BlobMeta => 7,
            ContentType::BlobSection => 8,
            ContentType::Avatar => 9,
            ContentType::Server => 10,
            ContentType::Vouch => 11,
            ContentType::Claim => 12,
            ContentType::Block => 13,
            ContentType::Banner => 14,
            ContentType::Opaque(tag) => tag,
        }
    }
}

impl ContentType {
    pub fn tag(self) -> u64 {
        self.into()
    }

    /// The named variant for reserved tags.
    pub fn canonical(self) -> Self {
        ContentType::from(self.tag())
    }
}

impl PartialEq for ContentType {
    fn eq(&self, other: &Self) -> bool {
        self.tag() == other.tag()
    }
}

impl Eq for ContentType {}

impl Ord for ContentType {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.tag().cmp(&other.tag())
    }
}

impl PartialOrd for ContentType {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::hash::Hash for ContentType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.tag().hash(state);
    }
}

/// Last-writer-wins register value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwElement {
    pub value: Vec<u8>,
    pub unix_milliseconds: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LwwSetOperation {
    Add,
    Remove,
}

/// One add or remove against a last-writer-wins element set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwElementSetDelta {
    pub operation: LwwSetOperation,
    pub value: Vec<u8>,
    pub unix_milliseconds: u64,
}

/// A reference from one event to something else.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reference {
    Pointer(Pointer),
    Bytes(Vec<u8>),
}

/// An immutable event authored at `(system, process, logical_clock)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub system: PublicKey,
    pub process: Process,
    pub logical_clock: u64,
    pub content_type: ContentType,
    pub content: Vec<u8>,
    pub lww_element: Option<LwwElement>,
    pub lww_element_set: Option<LwwElementSetDelta>,
    pub references: Vec<Reference>,
    /// The previous event of the same process.
    pub previous: Option<Pointer>,
}

impl Event {
    pub fn new(
        system: PublicKey,
        process: Process,
        logical_clock: u64,
        content_type: ContentType,
        content: Vec<u8>,
    ) -> Self {
        Self {
            system,
            process,
            logical_clock,
            content_type,
            content,
            lww_element: None,
            lww_element_set: None,
            references: Vec::new(),
            previous: None,
        }
    }

    pub fn with_lww_element(mut self, element: LwwElement) -> Self {
        self.lww_element = Some(element);
        self
    }

    pub fn with_lww_element_set(mut self, delta: LwwElementSetDelta) -> Self {
        self.lww_element_set = Some(delta);
        self
    }

    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.references.push(reference);
        self
    }

    pub fn with_previous(mut self, previous: Option<Pointer>) -> Self {
        self.previous = previous;
        self
    }
}

/// Body of a `Delete` event: the target in the author's own system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteBody {
    pub process: Process,
    pub logical_clock: u64,
    pub content_type: ContentType,
}

/// Body of a `SystemProcesses` announcement.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemProcessesBody {
    pub processes: Vec<Process>,
}
