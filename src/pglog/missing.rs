use super::entry::{LogEntry, ObjectId};
use super::version::Eversion;
use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingItem {
    pub need: Eversion,
    pub have: Eversion,
    pub is_delete: bool,
}

/// Objects this replica holds at an older version than the log requires.
/// Every tracked item satisfies `have < need`.
#[derive(Debug, Clone, Default)]
pub struct MissingObjectTracker {
    items: BTreeMap<ObjectId, MissingItem>,
    by_need: BTreeSet<(Eversion, ObjectId)>,
    changed: BTreeSet<ObjectId>,
}

impl MissingObjectTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, object: ObjectId, need: Eversion, have: Eversion, is_delete: bool) {
        assert!(
            have < need,
            "missing item for {object} must be behind: have={have} need={need}"
        );
        if let Some(previous) = self.items.get(&object) {
            self.by_need.remove(&(previous.need, object.clone()));
        }
        trace!("event=missing_add object={object} need={need} have={have}");
        self.by_need.insert((need, object.clone()));
        self.changed.insert(object.clone());
        self.items.insert(
            object,
            MissingItem {
                need,
                have,
                is_delete,
            },
        );
    }

    pub fn remove(&mut self, object: &ObjectId) -> Option<MissingItem> {
        let item = self.items.remove(object)?;
        self.by_need.remove(&(item.need, object.clone()));
        self.changed.insert(object.clone());
        trace!("event=missing_remove object={object} need={}", item.need);
        Some(item)
    }

    pub fn is_missing(&self, object: &ObjectId) -> Option<&MissingItem> {
        self.items.get(object)
    }

    pub fn num_missing(&self) -> usize {
        self.items.len()
    }

    pub fn have_missing(&self) -> bool {
        !self.items.is_empty()
    }

    /// Lowest version any missing object still needs.
    pub fn first_missing_need(&self) -> Option<Eversion> {
        self.by_need.iter().next().map(|(need, _)| *need)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectId, &MissingItem)> + '_ {
        self.items.iter()
    }

    /// Replaces the needed version, keeping `have`. An object that already
    /// holds the revised version stops being missing.
    pub fn revise_need(&mut self, object: ObjectId, need: Eversion, is_delete: bool) {
        let have = self
            .items
            .get(&object)
            .map(|item| item.have)
            .unwrap_or(Eversion::ZERO);
        if have >= need {
            self.remove(&object);
        } else {
            self.add(object, need, have, is_delete);
        }
    }

    /// Replaces the version the replica holds, keeping `need`.
    pub fn revise_have(&mut self, object: &ObjectId, have: Eversion) {
        if let Some(item) = self.items.get_mut(object) {
            item.have = have;
            self.changed.insert(object.clone());
        }
    }

    /// Records that `object` was recovered to `version`.
    pub fn got(&mut self, object: &ObjectId, version: Eversion) {
        match self.items.get(object) {
            Some(item) if item.need <= version => {
                self.remove(object);
            }
            Some(item) => {
                let need = item.need;
                let is_delete = item.is_delete;
                self.add(object.clone(), need, version, is_delete);
            }
            None => {}
        }
    }

    /// Folds a newly logged mutation into the missing set.
    pub fn add_next_event(&mut self, entry: &LogEntry) {
        if !entry.object_is_indexed() {
            return;
        }
        match self.items.get(&entry.object).copied() {
            Some(item) if item.need >= entry.version => {}
            Some(_) if entry.prior_version.is_zero() => {
                self.add(
                    entry.object.clone(),
                    entry.version,
                    Eversion::ZERO,
                    entry.is_delete(),
                );
            }
            Some(item) => {
                self.add(
                    entry.object.clone(),
                    entry.version,
                    item.have,
                    entry.is_delete(),
                );
            }
            None => {
                self.add(
                    entry.object.clone(),
                    entry.version,
                    entry.prior_version,
                    entry.is_delete(),
                );
            }
        }
    }

    /// Objects whose entry changed since the last persisted write.
    pub fn changes(&self) -> Vec<ObjectId> {
        self.changed.iter().cloned().collect()
    }

    pub fn clear_changes(&mut self) {
        self.changed.clear();
    }

    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    pub fn clear(&mut self) {
        for object in self.items.keys() {
            self.changed.insert(object.clone());
        }
        self.items.clear();
        self.by_need.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(version: u64) -> Eversion {
        Eversion::new(2, version)
    }

    #[test]
    fn add_replaces_previous_need() {
        let mut missing = MissingObjectTracker::new();
        let obj = ObjectId::new("a");
        missing.add(obj.clone(), v(5), v(1), false);
        missing.add(obj.clone(), v(7), v(1), false);
        assert_eq!(missing.num_missing(), 1);
        assert_eq!(missing.first_missing_need(), Some(v(7)));
        assert_eq!(missing.is_missing(&obj).unwrap().need, v(7));
    }

    #[test]
    #[should_panic(expected = "must be behind")]
    fn rejects_items_that_are_not_behind() {
        let mut missing = MissingObjectTracker::new();
        missing.add(ObjectId::new("a"), v(3), v(3), false);
    }

    #[test]
    fn next_event_tracks_have_from_prior_version() {
        let mut missing = MissingObjectTracker::new();
        missing.add_next_event(&LogEntry::modify(v(4), "a", v(2)));
        let item = *missing.is_missing(&ObjectId::new("a")).unwrap();
        assert_eq!((item.need, item.have), (v(4), v(2)));

        // already missing: need moves forward, have stays
        missing.add_next_event(&LogEntry::delete(v(6), "a", v(4)));
        let item = *missing.is_missing(&ObjectId::new("a")).unwrap();
        assert_eq!((item.need, item.have, item.is_delete), (v(6), v(2), true));

        // older event than what is already needed is ignored
        missing.add_next_event(&LogEntry::modify(v(5), "a", v(4)));
        assert_eq!(missing.is_missing(&ObjectId::new("a")).unwrap().need, v(6));

        missing.add_next_event(&LogEntry::error(v(7), "b", -2));
        assert!(missing.is_missing(&ObjectId::new("b")).is_none());
    }

    #[test]
    fn revise_need_and_got() {
        let mut missing = MissingObjectTracker::new();
        let obj = ObjectId::new("a");
        missing.add(obj.clone(), v(9), v(3), false);
        missing.revise_need(obj.clone(), v(3), false);
        assert!(missing.is_missing(&obj).is_none());

        missing.add(obj.clone(), v(9), v(3), false);
        missing.got(&obj, v(5));
        assert_eq!(missing.is_missing(&obj).unwrap().have, v(5));
        missing.got(&obj, v(9));
        assert_eq!(missing.num_missing(), 0);
        assert!(missing.has_changes());
        assert_eq!(missing.changes(), vec![obj]);
        missing.clear_changes();
        assert!(!missing.has_changes());
    }
}
