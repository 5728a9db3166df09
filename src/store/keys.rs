//! Binary key layout
//!
//! Every key starts with a one-byte table tag. Variable-length parts are
//! length-prefixed and integers are big-endian, so the byte order of keys
//! matches the logical order each index is read in.

use crate::model::{ContentType, Process, PublicKey};

pub(crate) const EVENT: u8 = 0x01;
pub(crate) const PROCESS_STATE: u8 = 0x02;
pub(crate) const SYSTEM_STATE: u8 = 0x03;
pub(crate) const TOMBSTONE: u8 = 0x04;
pub(crate) const CONTENT_INDEX: u8 = 0x05;
pub(crate) const REFERENCE_POINTER: u8 = 0x06;
pub(crate) const REFERENCE_BYTES: u8 = 0x07;
pub(crate) const SERVER_ACK: u8 = 0x08;
pub(crate) const ADDRESS_HINT: u8 = 0x09;

fn push_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn push_system(buf: &mut Vec<u8>, system: &PublicKey) {
    buf.push(system.key_type());
    push_bytes(buf, system.key());
}

fn push_location(buf: &mut Vec<u8>, system: &PublicKey, process: &Process, clock: u64) {
    push_system(buf, system);
    buf.extend_from_slice(process.as_bytes());
    buf.extend_from_slice(&clock.to_be_bytes());
}

fn tagged(tag: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.push(tag);
    buf
}

pub(crate) fn event(system: &PublicKey, process: &Process, clock: u64) -> Vec<u8> {
    let mut buf = tagged(EVENT);
    push_location(&mut buf, system, process, clock);
    buf
}

pub(crate) fn process_state_prefix(system: &PublicKey) -> Vec<u8> {
    let mut buf = tagged(PROCESS_STATE);
    push_system(&mut buf, system);
    buf
}

pub(crate) fn process_state(system: &PublicKey, process: &Process) -> Vec<u8> {
    let mut buf = process_state_prefix(system);
    buf.extend_from_slice(process.as_bytes());
    buf
}

pub(crate) fn system_state(system: &PublicKey) -> Vec<u8> {
    let mut buf = tagged(SYSTEM_STATE);
    push_system(&mut buf, system);
    buf
}

pub(crate) fn tombstone(system: &PublicKey, process: &Process, clock: u64) -> Vec<u8> {
    let mut buf = tagged(TOMBSTONE);
    push_location(&mut buf, system, process, clock);
    buf
}

pub(crate) fn content_index_prefix(system: &PublicKey, content_type: ContentType) -> Vec<u8> {
    let mut buf = tagged(CONTENT_INDEX);
    push_system(&mut buf, system);
    buf.extend_from_slice(&content_type.tag().to_be_bytes());
    buf
}

/// Clock is stored inverted so ascending keys read newest first.
pub(crate) fn content_index(
    system: &PublicKey,
    content_type: ContentType,
    process: &Process,
    clock: u64,
) -> Vec<u8> {
    let mut buf = content_index_prefix(system, content_type);
    buf.extend_from_slice(&(u64::MAX - clock).to_be_bytes());
    buf.extend_from_slice(process.as_bytes());
    buf
}

pub(crate) fn reference_pointer_prefix(system: &PublicKey, process: &Process, clock: u64) -> Vec<u8> {
    let mut buf = tagged(REFERENCE_POINTER);
    push_location(&mut buf, system, process, clock);
    buf
}

pub(crate) fn reference_pointer(
    target: (&PublicKey, &Process, u64),
    referrer: (&PublicKey, &Process, u64),
) -> Vec<u8> {
    let mut buf = reference_pointer_prefix(target.0, target.1, target.2);
    push_location(&mut buf, referrer.0, referrer.1, referrer.2);
    buf
}

pub(crate) fn reference_bytes_prefix(bytes: &[u8]) -> Vec<u8> {
    let mut buf = tagged(REFERENCE_BYTES);
    push_bytes(&mut buf, bytes);
    buf
}

pub(crate) fn reference_bytes(bytes: &[u8], referrer: (&PublicKey, &Process, u64)) -> Vec<u8> {
    let mut buf = reference_bytes_prefix(bytes);
    push_location(&mut buf, referrer.0, referrer.1, referrer.2);
    buf
}

pub(crate) fn server_ack_prefix(server: &str, system: &PublicKey) -> Vec<u8> {
    let mut buf = tagged(SERVER_ACK);
    push_bytes(&mut buf, server.as_bytes());
    push_system(&mut buf, system);
    buf
}

pub(crate) fn server_ack(server: &str, system: &PublicKey, process: &Process) -> Vec<u8> {
    let mut buf = server_ack_prefix(server, system);
    buf.extend_from_slice(process.as_bytes());
    buf
}

pub(crate) fn address_hint_prefix(system: &PublicKey) -> Vec<u8> {
    let mut buf = tagged(ADDRESS_HINT);
    push_system(&mut buf, system);
    buf
}

pub(crate) fn address_hint(system: &PublicKey, server: &str) -> Vec<u8> {
    let mut buf = address_hint_prefix(system);
    push_bytes(&mut buf, server.as_bytes());
    buf
}
