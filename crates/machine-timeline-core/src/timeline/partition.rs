//! Interval partition of one machine's timeline for one slot kind.
//!
//! Slots are kept in an ordered map keyed by their begin, so locating the
//! slots overlapping a range costs one lookup for the slot that starts
//! before the range plus a range scan; inserting at the tail of a long
//! history only touches the last slot.
//!
//! Every operation returns the slots it created and destroyed as
//! [`SlotChange`]s, in application order: replaying them on the persisted
//! copy reproduces the in-memory state, and feeding them to the
//! accumulators keeps the summaries in step with the timeline.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;

use super::range::cmp_end;
use super::{Slot, SlotAttributes, SlotChange, TimeRange};
use crate::error::ValidationError;

#[derive(Debug, Clone)]
pub struct Partition<A> {
    slots: BTreeMap<DateTime<Utc>, Slot<A>>,
}

impl<A> Default for Partition<A> {
    fn default() -> Self {
        Self {
            slots: BTreeMap::new(),
        }
    }
}

impl<A: SlotAttributes> Partition<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a partition from persisted slots, validating it.
    pub fn from_slots(slots: impl IntoIterator<Item = Slot<A>>) -> Result<Self, String> {
        let mut partition = Self::new();
        for slot in slots {
            partition.slots.insert(slot.range.begin, slot);
        }
        partition.check()?;
        Ok(partition)
    }

    /// Add persisted slots that were left out of the first load. They are
    /// already stored, so no change is reported.
    pub fn load_history(
        &mut self,
        slots: impl IntoIterator<Item = Slot<A>>,
    ) -> Result<(), String> {
        for slot in slots {
            self.slots.insert(slot.range.begin, slot);
        }
        self.check()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Slot<A>> + '_ {
        self.slots.values()
    }

    pub fn first(&self) -> Option<&Slot<A>> {
        self.slots.values().next()
    }

    pub fn last(&self) -> Option<&Slot<A>> {
        self.slots.values().next_back()
    }

    pub fn get(&self, begin: DateTime<Utc>) -> Option<&Slot<A>> {
        self.slots.get(&begin)
    }

    /// Slot covering `at`, if any.
    pub fn at(&self, at: DateTime<Utc>) -> Option<&Slot<A>> {
        self.slots
            .range(..=at)
            .next_back()
            .map(|(_, slot)| slot)
            .filter(|slot| slot.range.contains(at))
    }

    pub fn overlapping(&self, range: &TimeRange) -> Vec<&Slot<A>> {
        self.overlapping_keys(range)
            .into_iter()
            .filter_map(|key| self.slots.get(&key))
            .collect()
    }

    /// Slot ending exactly where the slot starting at `begin` starts.
    pub fn previous(&self, begin: DateTime<Utc>) -> Option<&Slot<A>> {
        self.slots
            .range(..begin)
            .next_back()
            .map(|(_, slot)| slot)
            .filter(|slot| slot.range.end == Some(begin))
    }

    /// Slot starting exactly where `slot` ends.
    pub fn next(&self, slot: &Slot<A>) -> Option<&Slot<A>> {
        slot.range.end.and_then(|end| self.slots.get(&end))
    }

    /// Begins of the slots overlapping `range` plus their touching
    /// neighbors on each side.
    pub fn keys_around(&self, range: &TimeRange) -> Vec<DateTime<Utc>> {
        let mut keys = self.overlapping_keys(range);
        let left = match keys.first() {
            Some(first) => *first,
            None => range.begin,
        };
        if let Some(previous) = self.previous(left) {
            keys.insert(0, previous.range.begin);
        }
        let right_edge = match keys.last().and_then(|key| self.slots.get(key)) {
            Some(slot) => slot.range.end,
            None => range.end,
        };
        if let Some(edge) = right_edge {
            if self.slots.contains_key(&edge) && keys.last() != Some(&edge) {
                keys.push(edge);
            }
        }
        keys
    }

    /// Insert a slot for `range`, truncating or splitting whatever it
    /// overlaps, then merge it with equal neighbors.
    pub fn insert(
        &mut self,
        range: TimeRange,
        attrs: A,
    ) -> Result<Vec<SlotChange<A>>, ValidationError> {
        range.validate()?;
        let mut changes = Vec::new();
        self.carve(&range, &mut changes);
        self.put(Slot::new(range, attrs), &mut changes);
        self.merge_span(&range, &mut changes);
        Ok(compact(changes))
    }

    /// Rewrite the attributes of the parts of the slots covered by `range`.
    /// Gaps stay gaps.
    pub fn update<F>(
        &mut self,
        range: &TimeRange,
        mut rewrite: F,
    ) -> Result<Vec<SlotChange<A>>, ValidationError>
    where
        F: FnMut(&A) -> A,
    {
        range.validate()?;
        let mut changes = Vec::new();
        for key in self.overlapping_keys(range) {
            let Some(current) = self.slots.get(&key) else {
                continue;
            };
            let updated = rewrite(&current.attrs);
            if updated == current.attrs {
                continue;
            }
            let Some(inner) = current.range.intersection(range) else {
                continue;
            };
            let Some(old) = self.take(key, &mut changes) else {
                continue;
            };
            let (left, right) = outside_parts(&old, range);
            if let Some(left) = left {
                self.put(left, &mut changes);
            }
            self.put(Slot::new(inner, updated), &mut changes);
            if let Some(right) = right {
                self.put(right, &mut changes);
            }
        }
        self.merge_span(range, &mut changes);
        Ok(compact(changes))
    }

    /// Remove every part of the timeline covered by `range`.
    pub fn remove(&mut self, range: &TimeRange) -> Result<Vec<SlotChange<A>>, ValidationError> {
        range.validate()?;
        let mut changes = Vec::new();
        self.carve(range, &mut changes);
        Ok(compact(changes))
    }

    /// Replace the attributes of the slot starting at `begin` without
    /// touching its range. The new attributes must stay mergeable-equal to
    /// the old ones, which holds for computed fields.
    pub fn replace_attributes(&mut self, begin: DateTime<Utc>, attrs: A) -> Vec<SlotChange<A>> {
        let mut changes = Vec::new();
        let differs = matches!(self.slots.get(&begin), Some(slot) if slot.attrs != attrs);
        if differs {
            if let Some(old) = self.take(begin, &mut changes) {
                self.put(Slot::new(old.range, attrs), &mut changes);
            }
        }
        changes
    }

    /// Undo `changes` returned by an earlier operation. Changes of later
    /// operations must have been reverted first.
    pub fn revert(&mut self, changes: &[SlotChange<A>]) {
        for change in changes.iter().rev() {
            match change {
                SlotChange::Added(slot) => {
                    self.slots.remove(&slot.range.begin);
                }
                SlotChange::Removed(slot) => {
                    self.slots.insert(slot.range.begin, slot.clone());
                }
            }
        }
    }

    /// Verify the slots are sorted, non-empty, non-overlapping and that no
    /// two touching slots should have been merged.
    pub fn check(&self) -> Result<(), String> {
        let mut previous: Option<&Slot<A>> = None;
        for (key, slot) in &self.slots {
            if *key != slot.range.begin {
                return Err(format!("slot {} is indexed at {key}", slot.range));
            }
            if slot.range.validate().is_err() {
                return Err(format!("empty slot {}", slot.range));
            }
            if let Some(prev) = previous {
                match prev.range.end {
                    None => {
                        return Err(format!(
                            "open slot {} is followed by {}",
                            prev.range, slot.range
                        ))
                    }
                    Some(end) if end > slot.range.begin => {
                        return Err(format!("slots {} and {} overlap", prev.range, slot.range))
                    }
                    Some(end) if end == slot.range.begin && prev.attrs.mergeable(&slot.attrs) => {
                        return Err(format!(
                            "slots {} and {} should be merged",
                            prev.range, slot.range
                        ))
                    }
                    _ => {}
                }
            }
            previous = Some(slot);
        }
        Ok(())
    }

    fn overlapping_keys(&self, range: &TimeRange) -> Vec<DateTime<Utc>> {
        let mut keys = Vec::new();
        if let Some((key, slot)) = self.slots.range(..range.begin).next_back() {
            if slot.range.overlaps(range) {
                keys.push(*key);
            }
        }
        let upper = match range.end {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        keys.extend(
            self.slots
                .range((Bound::Included(range.begin), upper))
                .map(|(key, _)| *key),
        );
        keys
    }

    /// Drop the coverage of `range`, keeping the parts of the slots outside it.
    fn carve(&mut self, range: &TimeRange, changes: &mut Vec<SlotChange<A>>) {
        for key in self.overlapping_keys(range) {
            let Some(old) = self.take(key, changes) else {
                continue;
            };
            let (left, right) = outside_parts(&old, range);
            if let Some(left) = left {
                self.put(left, changes);
            }
            if let Some(right) = right {
                self.put(right, changes);
            }
        }
    }

    /// Merge touching mergeable slots from the left neighbor of `range`
    /// up to its right neighbor.
    fn merge_span(&mut self, range: &TimeRange, changes: &mut Vec<SlotChange<A>>) {
        let start = self
            .slots
            .range(..range.begin)
            .next_back()
            .map(|(key, _)| *key)
            .unwrap_or(range.begin);
        let keys: Vec<DateTime<Utc>> = self
            .slots
            .range(start..)
            .map(|(key, _)| *key)
            .take_while(|key| range.end.map_or(true, |end| *key <= end))
            .collect();

        let mut previous: Option<DateTime<Utc>> = None;
        for key in keys {
            if let Some(prev_key) = previous {
                let joinable = match (self.slots.get(&prev_key), self.slots.get(&key)) {
                    (Some(left), Some(right)) => {
                        left.range.is_adjacent_to(&right.range)
                            && left.attrs.mergeable(&right.attrs)
                    }
                    _ => false,
                };
                if joinable {
                    let left = self.take(prev_key, changes);
                    let right = self.take(key, changes);
                    if let (Some(left), Some(right)) = (left, right) {
                        let attrs = left.attrs.merged(&right.attrs);
                        let range = TimeRange {
                            begin: left.range.begin,
                            end: right.range.end,
                        };
                        self.put(Slot::new(range, attrs), changes);
                    }
                    continue;
                }
            }
            previous = Some(key);
        }
    }

    fn take(&mut self, key: DateTime<Utc>, changes: &mut Vec<SlotChange<A>>) -> Option<Slot<A>> {
        let slot = self.slots.remove(&key)?;
        changes.push(SlotChange::Removed(slot.clone()));
        Some(slot)
    }

    fn put(&mut self, slot: Slot<A>, changes: &mut Vec<SlotChange<A>>) {
        changes.push(SlotChange::Added(slot.clone()));
        self.slots.insert(slot.range.begin, slot);
    }
}

/// Parts of `slot` before and after `range`, with the slot's attributes.
fn outside_parts<A: Clone>(
    slot: &Slot<A>,
    range: &TimeRange,
) -> (Option<Slot<A>>, Option<Slot<A>>) {
    let left = (slot.range.begin < range.begin).then(|| {
        Slot::new(
            TimeRange {
                begin: slot.range.begin,
                end: Some(range.begin),
            },
            slot.attrs.clone(),
        )
    });
    let right = match range.end {
        Some(end) if cmp_end(slot.range.end, Some(end)) == Ordering::Greater => Some(Slot::new(
            TimeRange {
                begin: end,
                end: slot.range.end,
            },
            slot.attrs.clone(),
        )),
        _ => None,
    };
    (left, right)
}

/// Cancel slots that were added and removed again by the same operation.
fn compact<A: PartialEq>(changes: Vec<SlotChange<A>>) -> Vec<SlotChange<A>> {
    let mut kept: Vec<Option<SlotChange<A>>> = changes.into_iter().map(Some).collect();
    for i in 0..kept.len() {
        let matching = match &kept[i] {
            Some(SlotChange::Removed(removed)) => (0..i).rev().find(|&j| {
                matches!(&kept[j], Some(SlotChange::Added(added)) if added == removed)
            }),
            _ => None,
        };
        if let Some(j) = matching {
            kept[i] = None;
            kept[j] = None;
        }
    }
    kept.into_iter().flatten().collect()
}
