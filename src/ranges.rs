//! Range algebra over logical clocks
//!
//! A `RangesForProcess` is the set of clocks a replica holds for one process,
//! kept as sorted, non-overlapping, non-adjacent closed intervals. The only way
//! to build one is through the normalizing constructor, so every value in
//! circulation (including values decoded off the wire) is well-formed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Process;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("Invariant error: range low {low} is greater than high {high}")]
    InvariantError { low: u64, high: u64 },
}

/// A closed interval `[low, high]` of logical clocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawRange")]
pub struct Range {
    low: u64,
    high: u64,
}

#[derive(Deserialize)]
struct RawRange {
    low: u64,
    high: u64,
}

impl TryFrom<RawRange> for Range {
    type Error = RangeError;

    fn try_from(raw: RawRange) -> Result<Self, Self::Error> {
        Range::new(raw.low, raw.high)
    }
}

impl Range {
    pub fn new(low: u64, high: u64) -> Result<Self, RangeError> {
        if low > high {
            return Err(RangeError::InvariantError { low, high });
        }
        Ok(Self { low, high })
    }

    /// A range holding exactly one clock.
    pub fn single(clock: u64) -> Self {
        Self {
            low: clock,
            high: clock,
        }
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    /// Number of clocks covered, saturating at `u64::MAX`.
    pub fn len(&self) -> u64 {
        (self.high - self.low).saturating_add(1)
    }

    pub fn contains(&self, clock: u64) -> bool {
        self.low <= clock && clock <= self.high
    }
}

/// Normalized interval set for a single process.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Range>", into = "Vec<Range>")]
pub struct RangesForProcess {
    ranges: Vec<Range>,
}

impl TryFrom<Vec<Range>> for RangesForProcess {
    type Error = RangeError;

    fn try_from(ranges: Vec<Range>) -> Result<Self, Self::Error> {
        Ok(Self::from_ranges(ranges))
    }
}

impl From<RangesForProcess> for Vec<Range> {
    fn from(ranges: RangesForProcess) -> Self {
        ranges.ranges
    }
}

impl RangesForProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sort and merge raw `(low, high)` pairs. Fails if any pair has `low > high`.
    pub fn normalize<I>(pairs: I) -> Result<Self, RangeError>
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let ranges = pairs
            .into_iter()
            .map(|(low, high)| Range::new(low, high))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_ranges(ranges))
    }

    /// Sort and merge already-validated ranges.
    pub fn from_ranges(mut ranges: Vec<Range>) -> Self {
        ranges.sort_unstable();
        let mut merged: Vec<Range> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if last.high.saturating_add(1) >= range.low => {
                    last.high = last.high.max(range.high);
                }
                _ => merged.push(range),
            }
        }
        Self { ranges: merged }
    }

    pub fn single(clock: u64) -> Self {
        Self {
            ranges: vec![Range::single(clock)],
        }
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of clocks covered, saturating.
    pub fn len(&self) -> u64 {
        self.ranges
            .iter()
            .fold(0u64, |acc, r| acc.saturating_add(r.len()))
    }

    /// Highest covered clock.
    pub fn max(&self) -> Option<u64> {
        self.ranges.last().map(|r| r.high)
    }

    pub fn contains(&self, clock: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.high < clock);
        self.ranges.get(idx).is_some_and(|r| r.contains(clock))
    }

    /// Add one clock. Returns false if it was already covered.
    pub fn insert(&mut self, clock: u64) -> bool {
        if self.contains(clock) {
            return false;
        }
        let mut ranges = std::mem::take(&mut self.ranges);
        ranges.push(Range::single(clock));
        *self = Self::from_ranges(ranges);
        true
    }

    pub fn union(&self, other: &RangesForProcess) -> RangesForProcess {
        let mut ranges = self.ranges.clone();
        ranges.extend_from_slice(&other.ranges);
        Self::from_ranges(ranges)
    }

    /// Everything in `self` that is not in `other`.
    pub fn subtract(&self, other: &RangesForProcess) -> RangesForProcess {
        let mut out = Vec::new();
        let mut j = 0;
        for range in &self.ranges {
            let mut low = range.low;
            let high = range.high;
            let mut exhausted = false;
            while j < other.ranges.len() && other.ranges[j].high < low {
                j += 1;
            }
            let mut k = j;
            while k < other.ranges.len() && other.ranges[k].low <= high {
                let cut = other.ranges[k];
                if cut.low > low {
                    out.push(Range {
                        low,
                        high: cut.low - 1,
                    });
                }
                if cut.high >= high {
                    exhausted = true;
                    break;
                }
                low = cut.high + 1;
                k += 1;
            }
            if !exhausted {
                out.push(Range { low, high });
            }
        }
        // Output is already sorted and separated by removed clocks.
        Self { ranges: out }
    }

    /// Prefix of `self` covering at most `limit` clocks, splitting the last
    /// interval when needed.
    pub fn take_max_items(&self, limit: u64) -> RangesForProcess {
        let mut out = Vec::new();
        let mut remaining = limit;
        for range in &self.ranges {
            if remaining == 0 {
                break;
            }
            if range.len() <= remaining {
                out.push(*range);
                remaining -= range.len();
            } else {
                out.push(Range {
                    low: range.low,
                    high: range.low + (remaining - 1),
                });
                remaining = 0;
            }
        }
        Self { ranges: out }
    }

    /// Every covered clock in ascending order. Each call starts over.
    pub fn clocks(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|r| r.low..=r.high)
    }
}

/// Per-process ranges for a whole system.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangesForSystem {
    processes: BTreeMap<Process, RangesForProcess>,
}

impl RangesForSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ranges for a process. Empty ranges are dropped.
    pub fn insert(&mut self, process: Process, ranges: RangesForProcess) {
        if ranges.is_empty() {
            self.processes.remove(&process);
        } else {
            self.processes.insert(process, ranges);
        }
    }

    pub fn get(&self, process: &Process) -> Option<&RangesForProcess> {
        self.processes.get(process)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Process, &RangesForProcess)> {
        self.processes.iter()
    }

    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.processes.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn len(&self) -> u64 {
        self.processes
            .values()
            .fold(0u64, |acc, r| acc.saturating_add(r.len()))
    }

    /// Per-process subtraction; processes only present in `other` contribute nothing.
    pub fn subtract(&self, other: &RangesForSystem) -> RangesForSystem {
        let mut out = RangesForSystem::new();
        for (process, ranges) in &self.processes {
            let diff = match other.get(process) {
                Some(theirs) => ranges.subtract(theirs),
                None => ranges.clone(),
            };
            out.insert(*process, diff);
        }
        out
    }

    /// Bound a multi-process request to at most `limit` clocks in total,
    /// taking processes in key order.
    pub fn take_max_items(&self, limit: u64) -> RangesForSystem {
        let mut out = RangesForSystem::new();
        let mut remaining = limit;
        for (process, ranges) in &self.processes {
            if remaining == 0 {
                break;
            }
            let taken = ranges.take_max_items(remaining);
            remaining -= taken.len();
            out.insert(*process, taken);
        }
        out
    }
}

impl FromIterator<(Process, RangesForProcess)> for RangesForSystem {
    fn from_iter<T: IntoIterator<Item = (Process, RangesForProcess)>>(iter: T) -> Self {
        let mut out = RangesForSystem::new();
        for (process, ranges) in iter {
            out.insert(process, ranges);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rp(pairs: &[(u64, u64)]) -> RangesForProcess {
        RangesForProcess::normalize(pairs.iter().copied()).unwrap()
    }

    fn is_well_formed(r: &RangesForProcess) -> bool {
        r.ranges()
            .windows(2)
            .all(|w| w[0].high().saturating_add(1) < w[1].low())
            && r.ranges().iter().all(|x| x.low() <= x.high())
    }

    #[test]
    fn test_normalize_merges_overlapping_and_adjacent() {
        let r = rp(&[(5, 7), (1, 2), (3, 3), (9, 12), (10, 11)]);
        assert_eq!(r, rp(&[(1, 3), (5, 7), (9, 12)]));
        assert_eq!(r.ranges().len(), 3);
        assert!(is_well_formed(&r));
    }

    #[test]
    fn test_normalize_rejects_inverted_range() {
        let err = RangesForProcess::normalize([(1, 2), (9, 4)]).unwrap_err();
        assert_eq!(err, RangeError::InvariantError { low: 9, high: 4 });
    }

    #[test]
    fn test_decode_rejects_inverted_range() {
        let mut buf = Vec::new();
        #[derive(Serialize)]
        struct Raw {
            low: u64,
            high: u64,
        }
        ciborium::into_writer(&vec![Raw { low: 4, high: 1 }], &mut buf).unwrap();
        let decoded: Result<RangesForProcess, _> = ciborium::from_reader(&buf[..]);
        assert!(decoded.is_err());
    }

    #[test]
    fn test_decode_normalizes_unsorted_input() {
        let input = vec![Range::new(5, 6).unwrap(), Range::new(1, 4).unwrap()];
        let mut buf = Vec::new();
        ciborium::into_writer(&input, &mut buf).unwrap();
        let decoded: RangesForProcess = ciborium::from_reader(&buf[..]).unwrap();
        assert_eq!(decoded, rp(&[(1, 6)]));
    }

    #[test]
    fn test_subtract_scenario() {
        let local = rp(&[(1, 5)]);
        let remote = rp(&[(1, 3)]);
        assert_eq!(local.subtract(&remote), rp(&[(4, 5)]));
    }

    #[test]
    fn test_subtract_splits_and_handles_edges() {
        let a = rp(&[(0, 10), (20, 30)]);
        let b = rp(&[(0, 0), (3, 4), (10, 22), (29, 40)]);
        let diff = a.subtract(&b);
        assert_eq!(diff, rp(&[(1, 2), (5, 9), (23, 28)]));
        assert!(is_well_formed(&diff));
    }

    #[test]
    fn test_subtract_self_is_empty() {
        let samples = [rp(&[]), rp(&[(1, 1)]), rp(&[(0, 3), (7, 9), (100, 200)])];
        for a in &samples {
            assert!(a.subtract(a).is_empty());
            for b in &samples {
                let diff = a.subtract(b);
                assert!(is_well_formed(&diff));
                assert_eq!(diff, RangesForProcess::from_ranges(diff.ranges().to_vec()));
                for clock in a.clocks() {
                    assert_eq!(diff.contains(clock), !b.contains(clock));
                }
            }
        }
    }

    #[test]
    fn test_subtract_at_u64_max() {
        let a = rp(&[(u64::MAX - 2, u64::MAX)]);
        let b = rp(&[(u64::MAX, u64::MAX)]);
        assert_eq!(a.subtract(&b), rp(&[(u64::MAX - 2, u64::MAX - 1)]));
    }

    #[test]
    fn test_take_max_items_splits_last_interval() {
        let r = rp(&[(1, 3), (10, 20)]);
        assert_eq!(r.take_max_items(0), rp(&[]));
        assert_eq!(r.take_max_items(2), rp(&[(1, 2)]));
        assert_eq!(r.take_max_items(3), rp(&[(1, 3)]));
        assert_eq!(r.take_max_items(5), rp(&[(1, 3), (10, 11)]));
        assert_eq!(r.take_max_items(100), r);
    }

    #[test]
    fn test_clocks_is_restartable() {
        let r = rp(&[(1, 2), (5, 6)]);
        let first: Vec<u64> = r.clocks().collect();
        let second: Vec<u64> = r.clocks().collect();
        assert_eq!(first, vec![1, 2, 5, 6]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_insert_and_contains() {
        let mut r = RangesForProcess::new();
        assert!(r.insert(3));
        assert!(r.insert(1));
        assert!(!r.insert(3));
        assert!(r.insert(2));
        assert_eq!(r, rp(&[(1, 3)]));
        assert!(r.contains(2));
        assert!(!r.contains(4));
        assert_eq!(r.max(), Some(3));
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn test_system_take_max_items_spans_processes() {
        let p1 = Process::from_bytes([1; 16]);
        let p2 = Process::from_bytes([2; 16]);
        let system: RangesForSystem =
            [(p1, rp(&[(1, 3)])), (p2, rp(&[(1, 4)]))].into_iter().collect();

        let batch = system.take_max_items(5);
        assert_eq!(batch.len(), 5);
        assert_eq!(batch.get(&p1), Some(&rp(&[(1, 3)])));
        assert_eq!(batch.get(&p2), Some(&rp(&[(1, 2)])));

        let rest = system.subtract(&batch);
        assert_eq!(rest.get(&p1), None);
        assert_eq!(rest.get(&p2), Some(&rp(&[(3, 4)])));
    }
}
