//! Depth-sorted transparency list
//!
//! Records live in an arena and are threaded onto one sorted list. New or
//! moved records wait on a dirty queue; [`TransparencyList::resort`] merges
//! them back in when only a few changed and re-sorts everything otherwise.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::core::config::SortOrder;
use crate::foundation::collections::{new_key_type, Linked, Links, SiblingList, SlotMap};
use crate::foundation::math::Point3;
use crate::render::bins::{AtomKey, TextureBinKey};
use crate::scene::{DepthSortKey, DrawAtomId, TransparencyComparator};

new_key_type! {
    /// Handle of a depth-sort record
    pub struct TransparentKey;
}

/// What a record draws
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortTarget {
    /// Every transparent atom of a texture bin, molecule by molecule
    TextureBin(TextureBinKey),
    /// One geometry piece of one atom
    Piece {
        /// Owning atom
        atom: AtomKey,
        /// Piece index
        piece: usize,
    },
}

/// One entry of the transparency list
#[derive(Debug, Clone)]
pub struct TransparentRenderingInfo {
    /// What to draw
    pub target: SortTarget,
    /// Atom identity, for comparators
    pub atom: Option<DrawAtomId>,
    /// World-space centroid
    pub centroid: Point3,
    /// Squared eye distance
    pub depth: f32,
    links: Links<TransparentKey>,
    linked: bool,
}

impl TransparentRenderingInfo {
    fn sort_key(&self) -> DepthSortKey {
        DepthSortKey {
            depth: self.depth,
            centroid: self.centroid,
            atom: self.atom,
        }
    }
}

impl Linked<TransparentKey> for TransparentRenderingInfo {
    fn links(&self) -> &Links<TransparentKey> {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links<TransparentKey> {
        &mut self.links
    }
}

/// What the last [`TransparencyList::resort`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResortKind {
    /// Nothing was dirty
    #[default]
    Unchanged,
    /// Unsorted mode: dirty records appended in arrival order
    Appended,
    /// Dirty records merged into the sorted list
    Incremental,
    /// Whole list re-sorted
    Full,
}

/// Sorted transparent records of one domain
pub struct TransparencyList {
    records: SlotMap<TransparentKey, TransparentRenderingInfo>,
    list: SiblingList<TransparentKey>,
    dirty: Vec<TransparentKey>,
    eye: Point3,
    order: SortOrder,
    comparator: Option<Arc<dyn TransparencyComparator>>,
    threshold: f32,
    sorting: bool,
    needs_full: bool,
}

impl std::fmt::Debug for TransparencyList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransparencyList")
            .field("len", &self.records.len())
            .field("dirty", &self.dirty.len())
            .field("order", &self.order)
            .field("sorting", &self.sorting)
            .field("comparator", &self.comparator.is_some())
            .finish()
    }
}

impl TransparencyList {
    /// Empty list; incremental merge is used while `dirty < threshold * len`
    pub fn new(order: SortOrder, threshold: f32, sorting: bool) -> Self {
        Self {
            records: SlotMap::with_key(),
            list: SiblingList::new(),
            dirty: Vec::new(),
            eye: Point3::origin(),
            order,
            comparator: None,
            threshold,
            sorting,
            needs_full: false,
        }
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether there are no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record by key
    pub fn get(&self, key: TransparentKey) -> Option<&TransparentRenderingInfo> {
        self.records.get(key)
    }

    fn depth_of(&self, centroid: &Point3) -> f32 {
        (centroid - self.eye).norm_squared()
    }

    /// Add a record; it joins the list on the next resort
    pub fn insert(&mut self, target: SortTarget, centroid: Point3, atom: Option<DrawAtomId>) -> TransparentKey {
        let depth = self.depth_of(&centroid);
        let key = self.records.insert(TransparentRenderingInfo {
            target,
            atom,
            centroid,
            depth,
            links: Links::default(),
            linked: false,
        });
        self.dirty.push(key);
        key
    }

    /// Drop a record; `None` if it was already gone
    pub fn remove(&mut self, key: TransparentKey) -> Option<SortTarget> {
        let linked = self.records.get(key)?.linked;
        if linked {
            self.list.unlink(&mut self.records, key);
        } else {
            self.dirty.retain(|k| *k != key);
        }
        self.records.remove(key).map(|r| r.target)
    }

    /// Move a record's centroid; it is re-placed on the next resort
    pub fn update_centroid(&mut self, key: TransparentKey, centroid: Point3) {
        let depth = self.depth_of(&centroid);
        let Some(record) = self.records.get_mut(key) else {
            return;
        };
        record.centroid = centroid;
        record.depth = depth;
        if record.linked {
            record.linked = false;
            self.list.unlink(&mut self.records, key);
            self.dirty.push(key);
        }
    }

    /// Move the eye; every depth changes
    pub fn set_eye(&mut self, eye: Point3) {
        if eye == self.eye {
            return;
        }
        self.eye = eye;
        for (_, record) in self.records.iter_mut() {
            record.depth = (record.centroid - eye).norm_squared();
        }
        self.needs_full = true;
    }

    /// Change the sort direction
    pub fn set_order(&mut self, order: SortOrder) {
        if order != self.order {
            self.order = order;
            self.needs_full = true;
        }
    }

    /// Install or drop a custom comparator
    pub fn set_comparator(&mut self, comparator: Option<Arc<dyn TransparencyComparator>>) {
        self.comparator = comparator;
        self.needs_full = true;
    }

    fn compare(&self, a: &TransparentRenderingInfo, b: &TransparentRenderingInfo) -> Ordering {
        if let Some(comparator) = &self.comparator {
            return comparator.compare(&a.sort_key(), &b.sort_key());
        }
        match self.order {
            SortOrder::BackToFront => b.depth.total_cmp(&a.depth),
            SortOrder::FrontToBack => a.depth.total_cmp(&b.depth),
        }
    }

    fn compare_keys(&self, a: TransparentKey, b: TransparentKey) -> Ordering {
        match (self.records.get(a), self.records.get(b)) {
            (Some(a), Some(b)) => self.compare(a, b),
            _ => Ordering::Equal,
        }
    }

    /// Restore the ordering invariant
    pub fn resort(&mut self) -> ResortKind {
        if !self.sorting {
            if self.dirty.is_empty() {
                return ResortKind::Unchanged;
            }
            for key in std::mem::take(&mut self.dirty) {
                self.link_back(key);
            }
            self.needs_full = false;
            return ResortKind::Appended;
        }
        if !self.needs_full && self.dirty.is_empty() {
            return ResortKind::Unchanged;
        }

        let incremental = !self.needs_full && (self.dirty.len() as f32) < self.threshold * self.records.len() as f32;
        let mut dirty = std::mem::take(&mut self.dirty);
        if incremental {
            dirty.sort_by(|a, b| self.compare_keys(*a, *b));
            let mut cursor = self.list.head();
            for key in dirty {
                while let Some(at) = cursor {
                    if self.compare_keys(key, at) == Ordering::Less {
                        break;
                    }
                    cursor = self.records.get(at).and_then(|r| r.links().next);
                }
                match cursor {
                    Some(at) => {
                        self.list.insert_before(&mut self.records, at, key);
                        if let Some(record) = self.records.get_mut(key) {
                            record.linked = true;
                        }
                    }
                    None => self.link_back(key),
                }
            }
            ResortKind::Incremental
        } else {
            let mut all = self.list.keys(&self.records);
            all.append(&mut dirty);
            all.sort_by(|a, b| self.compare_keys(*a, *b));
            self.list = SiblingList::new();
            for key in all {
                self.link_back(key);
            }
            self.needs_full = false;
            log::trace!("Full transparency resort of {} records", self.records.len());
            ResortKind::Full
        }
    }

    fn link_back(&mut self, key: TransparentKey) {
        self.list.push_back(&mut self.records, key);
        if let Some(record) = self.records.get_mut(key) {
            record.linked = true;
        }
    }

    /// Records in draw order
    pub fn iter(&self) -> impl Iterator<Item = (TransparentKey, &TransparentRenderingInfo)> {
        self.list.iter(&self.records)
    }

    /// Depths in draw order
    pub fn depths(&self) -> Vec<f32> {
        self.iter().map(|(_, r)| r.depth).collect()
    }

    /// Whether every adjacent pair is in order and nothing is waiting
    pub fn is_sorted(&self) -> bool {
        if !self.dirty.is_empty() || self.list.len() != self.records.len() {
            return false;
        }
        if !self.sorting {
            return true;
        }
        let keys = self.list.keys(&self.records);
        keys.windows(2)
            .all(|w| self.compare_keys(w[0], w[1]) != Ordering::Greater)
    }

    /// Drop every record, returning their targets
    pub fn clear(&mut self) -> Vec<SortTarget> {
        let targets = self.records.values().map(|r| r.target).collect();
        self.records.clear();
        self.list = SiblingList::new();
        self.dirty.clear();
        self.needs_full = false;
        targets
    }

    /// Switch between sorted and arrival order
    pub fn set_sorting(&mut self, sorting: bool) {
        if sorting != self.sorting {
            self.sorting = sorting;
            self.needs_full = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::collections::SlotMap as Arena;

    fn keys(n: usize) -> Vec<AtomKey> {
        let mut arena: Arena<AtomKey, ()> = Arena::with_key();
        (0..n).map(|_| arena.insert(())).collect()
    }

    fn at(x: f32) -> Point3 {
        Point3::new(x, 0.0, 0.0)
    }

    #[test]
    fn test_back_to_front_full_then_incremental() {
        let atoms = keys(4);
        let mut list = TransparencyList::new(SortOrder::BackToFront, 2.0 / 3.0, true);
        let records: Vec<_> = [5.0, 1.0, 9.0, 3.0]
            .iter()
            .zip(&atoms)
            .map(|(x, atom)| list.insert(SortTarget::Piece { atom: *atom, piece: 0 }, at(*x), None))
            .collect();
        assert_eq!(list.resort(), ResortKind::Full);
        assert_eq!(list.depths(), vec![81.0, 25.0, 9.0, 1.0]);

        list.update_centroid(records[1], at(7.0));
        assert_eq!(list.resort(), ResortKind::Incremental);
        assert_eq!(list.depths(), vec![81.0, 49.0, 25.0, 9.0]);
        assert!(list.is_sorted());
    }

    #[test]
    fn test_many_dirty_records_trigger_full_resort() {
        let atoms = keys(3);
        let mut list = TransparencyList::new(SortOrder::FrontToBack, 2.0 / 3.0, true);
        let records: Vec<_> = atoms
            .iter()
            .enumerate()
            .map(|(i, atom)| list.insert(SortTarget::Piece { atom: *atom, piece: 0 }, at(i as f32), None))
            .collect();
        list.resort();
        list.update_centroid(records[0], at(10.0));
        list.update_centroid(records[1], at(20.0));
        assert_eq!(list.resort(), ResortKind::Full);
        assert_eq!(list.depths(), vec![4.0, 100.0, 400.0]);
    }

    #[test]
    fn test_eye_move_and_removal() {
        let atoms = keys(2);
        let mut list = TransparencyList::new(SortOrder::BackToFront, 2.0 / 3.0, true);
        let near = list.insert(SortTarget::Piece { atom: atoms[0], piece: 0 }, at(1.0), None);
        list.insert(SortTarget::Piece { atom: atoms[1], piece: 0 }, at(4.0), None);
        list.resort();

        list.set_eye(at(5.0));
        assert_eq!(list.resort(), ResortKind::Full);
        assert_eq!(list.depths(), vec![16.0, 1.0]);

        assert!(list.remove(near).is_some());
        assert!(list.remove(near).is_none());
        assert_eq!(list.depths(), vec![1.0]);
        assert!(list.is_sorted());
    }

    #[test]
    fn test_unsorted_mode_keeps_arrival_order() {
        let atoms = keys(3);
        let mut list = TransparencyList::new(SortOrder::BackToFront, 2.0 / 3.0, false);
        for (x, atom) in [1.0, 3.0, 2.0].iter().zip(&atoms) {
            list.insert(SortTarget::Piece { atom: *atom, piece: 0 }, at(*x), None);
        }
        assert_eq!(list.resort(), ResortKind::Appended);
        assert_eq!(list.depths(), vec![1.0, 9.0, 4.0]);
        assert_eq!(list.clear().len(), 3);
        assert!(list.is_empty());
    }

    struct ById;

    impl TransparencyComparator for ById {
        fn compare(&self, a: &DepthSortKey, b: &DepthSortKey) -> Ordering {
            a.atom.cmp(&b.atom)
        }
    }

    #[test]
    fn test_custom_comparator_overrides_depth() {
        let atoms = keys(2);
        let mut list = TransparencyList::new(SortOrder::BackToFront, 2.0 / 3.0, true);
        list.set_comparator(Some(Arc::new(ById)));
        list.insert(SortTarget::Piece { atom: atoms[0], piece: 0 }, at(1.0), Some(DrawAtomId(2)));
        list.insert(SortTarget::Piece { atom: atoms[1], piece: 0 }, at(9.0), Some(DrawAtomId(1)));
        list.resort();
        let order: Vec<_> = list.iter().map(|(_, r)| r.atom).collect();
        assert_eq!(order, vec![Some(DrawAtomId(1)), Some(DrawAtomId(2))]);
    }
}
