//! Snapshot metadata: the archive's current state, the diff descriptors,
//! the relation classifier, and the in-memory catalog over on-disk wdiffs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use walbak_types::error::{Result, WalbakError};
use walbak_types::gid::{Gid, Snap};

/// The archive's current base-image position: a snap plus its wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaState {
    pub snap: Snap,
    pub timestamp_s: u64,
}

impl MetaState {
    pub fn new(snap: Snap, timestamp_s: u64) -> Self {
        MetaState { snap, timestamp_s }
    }
}

impl fmt::Display for MetaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.snap, self.timestamp_s)
    }
}

/// One diff file's descriptor: it carries the writes between `snap_b` and
/// `snap_e`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDiff {
    pub snap_b: Snap,
    pub snap_e: Snap,
    pub timestamp_s: u64,
    pub size_b: u64,
}

impl MetaDiff {
    pub fn new(snap_b: Snap, snap_e: Snap, timestamp_s: u64, size_b: u64) -> Result<Self> {
        if snap_b.gid0 > snap_e.gid0 {
            return Err(WalbakError::BadRequest(format!(
                "diff bounds inverted: {snap_b} -> {snap_e}"
            )));
        }
        Ok(MetaDiff {
            snap_b,
            snap_e,
            timestamp_s,
            size_b,
        })
    }

    pub fn is_dirty(&self) -> bool {
        self.snap_b.is_dirty() || self.snap_e.is_dirty()
    }

    /// On-disk file name for this diff.
    pub fn file_name(&self) -> String {
        format!("{}-{}.wdiff", self.snap_b.gid0, self.snap_e.gid0)
    }

    fn key(&self) -> (Gid, Gid, Gid, Gid) {
        (
            self.snap_b.gid0,
            self.snap_b.gid1,
            self.snap_e.gid0,
            self.snap_e.gid1,
        )
    }
}

impl fmt::Display for MetaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-->{}", self.snap_b, self.snap_e)
    }
}

/// Applying a diff moves the state to the diff's end snap.
pub fn apply_diff_to_state(diff: &MetaDiff) -> MetaState {
    MetaState {
        snap: diff.snap_e,
        timestamp_s: diff.timestamp_s,
    }
}

/// How a candidate diff relates to the catalog head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    ApplicableDiff,
    TooOldDiff,
    TooNewDiff,
}

impl Relation {
    pub fn message(self) -> &'static str {
        match self {
            Relation::ApplicableDiff => walbak_proto::msg::OK,
            Relation::TooOldDiff => walbak_proto::msg::TOO_OLD_DIFF,
            Relation::TooNewDiff => walbak_proto::msg::TOO_NEW_DIFF,
        }
    }
}

/// Classify `diff` against `head`.
///
/// Clean diff `b -> e`: applicable iff `b == head`; too-old iff the diff ends
/// at or below the head; otherwise not contiguous, reported too-new so the
/// client retries once the gap closes.
/// Dirty diff: applicable iff `b.gid0 == head.gid0` and `b.gid1 <= head.gid1`.
pub fn get_relation(head: Snap, diff: &MetaDiff) -> Relation {
    let b = diff.snap_b;
    if b.is_dirty() {
        if b.gid0 == head.gid0 && b.gid1 <= head.gid1 {
            return Relation::ApplicableDiff;
        }
        if diff.snap_e.gid0 < head.gid0 {
            return Relation::TooOldDiff;
        }
        return Relation::TooNewDiff;
    }
    if b == head {
        return Relation::ApplicableDiff;
    }
    if diff.snap_e.gid0 <= head.gid0 {
        return Relation::TooOldDiff;
    }
    Relation::TooNewDiff
}

/// In-memory index over the volume's diff files, ordered by begin gid.
/// Reloadable by scanning the volume directory; the archive mutates it under
/// the per-volume lock.
#[derive(Default)]
pub struct MetaDiffManager {
    diffs: BTreeMap<(Gid, Gid, Gid, Gid), MetaDiff>,
}

impl MetaDiffManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, diff: MetaDiff) {
        self.diffs.insert(diff.key(), diff);
    }

    pub fn erase(&mut self, diff: &MetaDiff) {
        self.diffs.remove(&diff.key());
    }

    pub fn clear(&mut self) {
        self.diffs.clear();
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    pub fn list(&self) -> Vec<MetaDiff> {
        self.diffs.values().copied().collect()
    }

    fn find_applicable(&self, head: Snap) -> Option<MetaDiff> {
        self.diffs
            .values()
            .filter(|d| get_relation(head, d) == Relation::ApplicableDiff)
            .max_by_key(|d| d.snap_e.gid0)
            .copied()
    }

    /// Head snap after applying every applicable diff in order.
    pub fn latest(&self, state: &MetaState) -> Snap {
        let mut head = state.snap;
        while let Some(d) = self.find_applicable(head) {
            head = d.snap_e;
        }
        head
    }

    /// Maximal applicable chain starting at `from`.
    pub fn applicable_list(&self, from: Snap) -> Vec<MetaDiff> {
        let mut chain = Vec::new();
        let mut head = from;
        while let Some(d) = self.find_applicable(head) {
            head = d.snap_e;
            chain.push(d);
        }
        chain
    }

    /// Chain to apply so the base reaches `gid`, stopping before any diff
    /// that ends past it.
    pub fn diffs_to_apply(&self, state: &MetaState, gid: Gid) -> Vec<MetaDiff> {
        let mut chain = Vec::new();
        let mut head = state.snap;
        while let Some(d) = self.find_applicable(head) {
            if d.snap_e.gid0 > gid {
                break;
            }
            head = d.snap_e;
            chain.push(d);
        }
        chain
    }

    /// Greedy span of adjacent diffs inside `[gid0, gid1]`, bounded by count
    /// and total size.
    pub fn select_for_merge(
        &self,
        gid0: Gid,
        gid1: Gid,
        max_count: usize,
        max_size_b: u64,
    ) -> Vec<MetaDiff> {
        let mut span: Vec<MetaDiff> = Vec::new();
        let mut total = 0u64;
        for d in self.diffs.values() {
            if d.snap_b.gid0 < gid0 {
                continue;
            }
            if d.snap_e.gid0 > gid1 {
                break;
            }
            if let Some(last) = span.last() {
                if d.snap_b != last.snap_e {
                    break;
                }
            }
            if span.len() + 1 > max_count || total + d.size_b > max_size_b {
                break;
            }
            total += d.size_b;
            span.push(*d);
        }
        span
    }

    /// Gids that a restore can target: clean end snaps reachable from the
    /// current state.
    pub fn restorable(&self, state: &MetaState) -> Vec<Gid> {
        let mut gids = Vec::new();
        if state.snap.is_clean() {
            gids.push(state.snap.gid0);
        }
        let mut head = state.snap;
        while let Some(d) = self.find_applicable(head) {
            head = d.snap_e;
            if head.is_clean() {
                gids.push(head.gid0);
            }
        }
        gids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean_diff(b: Gid, e: Gid) -> MetaDiff {
        MetaDiff::new(Snap::clean(b), Snap::clean(e), 0, 100).unwrap()
    }

    #[test]
    fn relation_clean_cases() {
        let head = Snap::clean(4);
        assert_eq!(get_relation(head, &clean_diff(4, 6)), Relation::ApplicableDiff);
        assert_eq!(get_relation(head, &clean_diff(2, 4)), Relation::TooOldDiff);
        assert_eq!(get_relation(head, &clean_diff(0, 2)), Relation::TooOldDiff);
        assert_eq!(get_relation(head, &clean_diff(6, 8)), Relation::TooNewDiff);
        // Straddling the head is not contiguous either.
        assert_eq!(get_relation(head, &clean_diff(2, 6)), Relation::TooNewDiff);
    }

    #[test]
    fn relation_dirty_cases() {
        let head = Snap::new(0, 1).unwrap();
        let dirty = MetaDiff::new(Snap::new(0, 1).unwrap(), Snap::clean(2), 0, 10).unwrap();
        assert_eq!(get_relation(head, &dirty), Relation::ApplicableDiff);

        let too_wide = MetaDiff::new(Snap::new(0, 3).unwrap(), Snap::clean(4), 0, 10).unwrap();
        assert_eq!(get_relation(head, &too_wide), Relation::TooNewDiff);

        let old = MetaDiff::new(Snap::new(0, 1).unwrap(), Snap::clean(2), 0, 10).unwrap();
        assert_eq!(get_relation(Snap::clean(5), &old), Relation::TooOldDiff);
    }

    #[test]
    fn latest_walks_the_chain() {
        let mut mgr = MetaDiffManager::new();
        mgr.add(clean_diff(0, 2));
        mgr.add(clean_diff(2, 4));
        mgr.add(clean_diff(4, 6));
        let state = MetaState::new(Snap::clean(0), 0);
        assert_eq!(mgr.latest(&state), Snap::clean(6));
        assert_eq!(mgr.applicable_list(Snap::clean(2)).len(), 2);
    }

    #[test]
    fn latest_from_dirty_state() {
        let mut mgr = MetaDiffManager::new();
        let d = MetaDiff::new(Snap::new(0, 1).unwrap(), Snap::clean(2), 0, 10).unwrap();
        mgr.add(d);
        mgr.add(clean_diff(2, 4));
        let state = MetaState::new(Snap::new(0, 1).unwrap(), 0);
        assert_eq!(mgr.latest(&state), Snap::clean(4));
    }

    #[test]
    fn merge_selection_respects_bounds() {
        let mut mgr = MetaDiffManager::new();
        mgr.add(clean_diff(0, 2));
        mgr.add(clean_diff(2, 4));
        mgr.add(clean_diff(4, 6));
        mgr.add(clean_diff(8, 10)); // gap: not adjacent

        let all = mgr.select_for_merge(0, 6, 10, u64::MAX);
        assert_eq!(all.len(), 3);

        let capped = mgr.select_for_merge(0, 6, 2, u64::MAX);
        assert_eq!(capped.len(), 2);

        let sized = mgr.select_for_merge(0, 6, 10, 150);
        assert_eq!(sized.len(), 1);

        // The gap stops the span even inside the gid range.
        let gap = mgr.select_for_merge(0, 10, 10, u64::MAX);
        assert_eq!(gap.len(), 3);
    }

    #[test]
    fn diffs_to_apply_stops_at_gid() {
        let mut mgr = MetaDiffManager::new();
        mgr.add(clean_diff(0, 2));
        mgr.add(clean_diff(2, 4));
        mgr.add(clean_diff(4, 6));
        let state = MetaState::new(Snap::clean(0), 0);
        let chain = mgr.diffs_to_apply(&state, 4);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.last().unwrap().snap_e, Snap::clean(4));
    }

    #[test]
    fn restorable_lists_clean_points() {
        let mut mgr = MetaDiffManager::new();
        mgr.add(clean_diff(0, 2));
        mgr.add(clean_diff(2, 4));
        let state = MetaState::new(Snap::clean(0), 0);
        assert_eq!(mgr.restorable(&state), vec![0, 2, 4]);
    }

    #[test]
    fn file_name_uses_begin_gids() {
        let d = MetaDiff::new(Snap::new(0, 1).unwrap(), Snap::clean(2), 0, 10).unwrap();
        assert_eq!(d.file_name(), "0-2.wdiff");
    }
}
