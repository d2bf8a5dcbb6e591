//! Lane scheduling.
//!
//! Records touching the same item share a lane and run strictly in enqueue
//! order. Records whose paths are nested (a folder and something inside it)
//! stay in separate lanes linked by `after_lanes`, so the newer lane waits
//! for the older one to drain. Edges always point from a higher lane id to a
//! lower one; whenever that would be violated the lanes are merged instead,
//! which keeps the graph acyclic.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use tracing::debug;

use super::paths::is_ancestor;
use super::record::{LaneId, RecordId, Tag};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLane {
    pub lane_id: LaneId,
    pub tags: BTreeSet<Tag>,
    pub after_lanes: BTreeSet<LaneId>,
    /// Ordered by record id, which is enqueue order.
    pub records: VecDeque<RecordId>,
    pub halted: bool,
}

impl SyncLane {
    fn new(lane_id: LaneId) -> Self {
        Self {
            lane_id,
            tags: BTreeSet::new(),
            after_lanes: BTreeSet::new(),
            records: VecDeque::new(),
            halted: false,
        }
    }

    pub fn head(&self) -> Option<RecordId> {
        self.records.front().copied()
    }

    fn is_related(&self, tags: &BTreeSet<Tag>) -> bool {
        self.tags.iter().any(|own| {
            tags.iter()
                .any(|tag| is_ancestor(own, tag) || is_ancestor(tag, own))
        })
    }
}

/// How the scheduler sees one record when picking work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// Pending with nothing left to wait for.
    Ready,
    /// Has work out on the network; occupies a running slot.
    Busy,
    /// Waiting on a local condition or failed.
    Blocked,
}

#[derive(Debug)]
pub struct LaneScheduler {
    lanes: BTreeMap<LaneId, SyncLane>,
    record_lanes: HashMap<RecordId, LaneId>,
    next_lane_id: LaneId,
    max_running_lanes: usize,
}

impl LaneScheduler {
    pub fn new(max_running_lanes: usize) -> Self {
        Self::starting_at(max_running_lanes, 1)
    }

    /// Continues numbering after ids handed out by a previous process.
    pub fn starting_at(max_running_lanes: usize, next_lane_id: LaneId) -> Self {
        Self {
            lanes: BTreeMap::new(),
            record_lanes: HashMap::new(),
            next_lane_id: next_lane_id.max(1),
            max_running_lanes: max_running_lanes.max(1),
        }
    }

    pub fn lane(&self, lane_id: LaneId) -> Option<&SyncLane> {
        self.lanes.get(&lane_id)
    }

    pub fn lanes(&self) -> impl Iterator<Item = &SyncLane> {
        self.lanes.values()
    }

    pub fn lane_of(&self, record_id: RecordId) -> Option<LaneId> {
        self.record_lanes.get(&record_id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Places `record_id` into a lane and returns the lane id.
    pub fn assign(&mut self, record_id: RecordId, tags: &BTreeSet<Tag>) -> LaneId {
        if let Some(lane_id) = self.lane_of(record_id) {
            return lane_id;
        }

        let overlapping: Vec<LaneId> = self
            .lanes
            .values()
            .filter(|lane| !lane.tags.is_disjoint(tags))
            .map(|lane| lane.lane_id)
            .collect();
        let related: Vec<LaneId> = self
            .lanes
            .values()
            .filter(|lane| lane.tags.is_disjoint(tags) && lane.is_related(tags))
            .map(|lane| lane.lane_id)
            .collect();

        let target = match overlapping.first() {
            Some(oldest) => *oldest,
            None => {
                let lane_id = self.next_lane_id;
                self.next_lane_id += 1;
                self.lanes.insert(lane_id, SyncLane::new(lane_id));
                lane_id
            }
        };

        let mut absorb: BTreeSet<LaneId> = overlapping.into_iter().filter(|id| *id != target).collect();
        for lane_id in related {
            if lane_id < target {
                if let Some(lane) = self.lanes.get_mut(&target) {
                    lane.after_lanes.insert(lane_id);
                }
            } else {
                absorb.insert(lane_id);
            }
        }
        self.merge_into(target, absorb);

        if let Some(lane) = self.lanes.get_mut(&target) {
            lane.tags.extend(tags.iter().cloned());
            let position = lane
                .records
                .iter()
                .position(|existing| *existing > record_id)
                .unwrap_or(lane.records.len());
            lane.records.insert(position, record_id);
        }
        self.record_lanes.insert(record_id, target);
        debug!(record_id, lane_id = target, "record assigned to lane");
        target
    }

    fn merge_into(&mut self, target: LaneId, mut absorb: BTreeSet<LaneId>) {
        while let Some(lane_id) = absorb.pop_first() {
            let Some(lane) = self.lanes.remove(&lane_id) else {
                continue;
            };
            debug!(from = lane_id, into = target, "merging lanes");
            for record_id in &lane.records {
                self.record_lanes.insert(*record_id, target);
            }
            for other in self.lanes.values_mut() {
                if other.after_lanes.remove(&lane_id) && other.lane_id != target {
                    other.after_lanes.insert(target);
                }
            }
            let Some(survivor) = self.lanes.get_mut(&target) else {
                return;
            };
            survivor.tags.extend(lane.tags);
            survivor.after_lanes.extend(lane.after_lanes);
            survivor.halted |= lane.halted;
            let mut records: Vec<RecordId> = survivor.records.drain(..).chain(lane.records).collect();
            records.sort_unstable();
            survivor.records = records.into();

            survivor.after_lanes.remove(&target);
            let newer: Vec<LaneId> = survivor
                .after_lanes
                .iter()
                .copied()
                .filter(|id| *id > target)
                .collect();
            for id in newer {
                survivor.after_lanes.remove(&id);
                absorb.insert(id);
            }
        }
    }

    /// Drops a finished or cancelled record. A lane left empty is retired
    /// and released from every dependency set.
    pub fn remove_record(&mut self, record_id: RecordId) -> Option<LaneId> {
        let lane_id = self.record_lanes.remove(&record_id)?;
        let drained = match self.lanes.get_mut(&lane_id) {
            Some(lane) => {
                lane.records.retain(|existing| *existing != record_id);
                lane.records.is_empty()
            }
            None => false,
        };
        if drained {
            self.lanes.remove(&lane_id);
            for lane in self.lanes.values_mut() {
                lane.after_lanes.remove(&lane_id);
            }
            debug!(lane_id, "lane drained");
        }
        Some(lane_id)
    }

    pub fn halt(&mut self, lane_id: LaneId) {
        if let Some(lane) = self.lanes.get_mut(&lane_id) {
            lane.halted = true;
        }
    }

    pub fn resume(&mut self, lane_id: LaneId) {
        if let Some(lane) = self.lanes.get_mut(&lane_id) {
            lane.halted = false;
        }
    }

    /// Heads that may start now, oldest lane first, within the running cap.
    pub fn eligible<F>(&self, status: F) -> Vec<RecordId>
    where
        F: Fn(RecordId) -> RecordStatus,
    {
        let busy = self
            .lanes
            .values()
            .filter(|lane| {
                lane.records
                    .iter()
                    .any(|record| status(*record) == RecordStatus::Busy)
            })
            .count();
        let mut slots = self.max_running_lanes.saturating_sub(busy);
        let mut out = Vec::new();
        for lane in self.lanes.values() {
            if slots == 0 {
                break;
            }
            if lane.halted || !lane.after_lanes.is_empty() {
                continue;
            }
            let Some(head) = lane.head() else {
                continue;
            };
            if status(head) != RecordStatus::Ready {
                continue;
            }
            if lane.records.iter().any(|record| status(*record) == RecordStatus::Busy) {
                continue;
            }
            out.push(head);
            slots -= 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(values: &[&str]) -> BTreeSet<Tag> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn ready(_: RecordId) -> RecordStatus {
        RecordStatus::Ready
    }

    #[test]
    fn disjoint_records_get_separate_lanes() {
        let mut lanes = LaneScheduler::new(4);
        let a = lanes.assign(1, &tags(&["/A"]));
        let b = lanes.assign(2, &tags(&["/B"]));
        assert_ne!(a, b);
        assert_eq!(lanes.eligible(ready), vec![1, 2]);
    }

    #[test]
    fn overlapping_records_share_a_lane_in_fifo_order() {
        let mut lanes = LaneScheduler::new(4);
        let first = lanes.assign(1, &tags(&["/A"]));
        let second = lanes.assign(2, &tags(&["/A", "/Dir"]));
        assert_eq!(first, second);
        assert_eq!(lanes.eligible(ready), vec![1]);

        lanes.remove_record(1);
        assert_eq!(lanes.eligible(ready), vec![2]);
    }

    #[test]
    fn a_record_bridging_two_lanes_merges_them_into_the_oldest() {
        let mut lanes = LaneScheduler::new(4);
        let a = lanes.assign(1, &tags(&["/A"]));
        let b = lanes.assign(2, &tags(&["/B"]));
        let merged = lanes.assign(3, &tags(&["/A", "/B"]));

        assert_eq!(merged, a);
        assert!(lanes.lane(b).is_none());
        let lane = lanes.lane(a).unwrap();
        assert_eq!(lane.records, VecDeque::from(vec![1, 2, 3]));
        assert_eq!(lanes.lane_of(2), Some(a));
    }

    #[test]
    fn nested_paths_depend_on_the_older_lane() {
        let mut lanes = LaneScheduler::new(4);
        let folder = lanes.assign(1, &tags(&["/Docs"]));
        let file = lanes.assign(2, &tags(&["/Docs/Sub/A.txt", "/Docs/Sub"]));

        assert_ne!(folder, file);
        assert!(lanes.lane(file).unwrap().after_lanes.contains(&folder));
        assert_eq!(lanes.eligible(ready), vec![1]);

        lanes.remove_record(1);
        assert!(lanes.lane(folder).is_none());
        assert!(lanes.lane(file).unwrap().after_lanes.is_empty());
        assert_eq!(lanes.eligible(ready), vec![2]);
    }

    #[test]
    fn newer_related_lane_is_merged_not_depended_on() {
        let mut lanes = LaneScheduler::new(4);
        let a = lanes.assign(1, &tags(&["/A"]));
        let nested = lanes.assign(2, &tags(&["/B/x"]));
        // Joins lane `a` by tag and is an ancestor of the newer lane.
        let target = lanes.assign(3, &tags(&["/A", "/B"]));

        assert_eq!(target, a);
        assert!(lanes.lane(nested).is_none());
        for lane in lanes.lanes() {
            assert!(lane.after_lanes.iter().all(|dep| *dep < lane.lane_id));
        }
    }

    #[test]
    fn dependents_of_a_merged_lane_point_at_the_survivor() {
        let mut lanes = LaneScheduler::new(4);
        let a = lanes.assign(1, &tags(&["/A"]));
        let b = lanes.assign(2, &tags(&["/B", "/Z"]));
        let child = lanes.assign(3, &tags(&["/Z/c"]));
        assert!(lanes.lane(child).unwrap().after_lanes.contains(&b));

        lanes.assign(4, &tags(&["/A", "/B"]));
        assert!(lanes.lane(child).unwrap().after_lanes.contains(&a));
        assert!(!lanes.lane(child).unwrap().after_lanes.contains(&b));
    }

    #[test]
    fn lane_ids_are_never_reused() {
        let mut lanes = LaneScheduler::new(4);
        let first = lanes.assign(1, &tags(&["/A"]));
        lanes.remove_record(1);
        assert!(lanes.is_empty());
        let second = lanes.assign(2, &tags(&["/A"]));
        assert!(second > first);
    }

    #[test]
    fn running_lanes_are_capped() {
        let mut lanes = LaneScheduler::new(2);
        lanes.assign(1, &tags(&["/A"]));
        lanes.assign(2, &tags(&["/B"]));
        lanes.assign(3, &tags(&["/C"]));

        let status = |record: RecordId| {
            if record == 1 {
                RecordStatus::Busy
            } else {
                RecordStatus::Ready
            }
        };
        assert_eq!(lanes.eligible(status), vec![2]);
    }

    #[test]
    fn halted_and_blocked_lanes_yield_nothing() {
        let mut lanes = LaneScheduler::new(4);
        let a = lanes.assign(1, &tags(&["/A"]));
        lanes.assign(2, &tags(&["/A"]));
        lanes.assign(3, &tags(&["/B"]));
        lanes.halt(a);

        let status = |record: RecordId| {
            if record == 3 {
                RecordStatus::Blocked
            } else {
                RecordStatus::Ready
            }
        };
        assert!(lanes.eligible(status).is_empty());

        lanes.resume(a);
        assert_eq!(lanes.eligible(status), vec![1]);
    }

    #[test]
    fn cancelled_middle_record_keeps_lane_order() {
        let mut lanes = LaneScheduler::new(4);
        let lane = lanes.assign(1, &tags(&["/A"]));
        lanes.assign(2, &tags(&["/A"]));
        lanes.assign(3, &tags(&["/A"]));
        lanes.remove_record(2);
        assert_eq!(lanes.lane(lane).unwrap().records, VecDeque::from(vec![1, 3]));
    }
}
