//! View settings and the visibility collaborator

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::config::{SortOrder, TransparencyConfig, TransparencySortMode};
use crate::foundation::math::{Frustum, Point3};
use crate::scene::draw_atom::DrawAtomId;

/// What a transparency comparator sees of one depth-sort record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthSortKey {
    /// Squared distance from the eye to the centroid
    pub depth: f32,
    /// World-space centroid
    pub centroid: Point3,
    /// Atom the record belongs to
    pub atom: Option<DrawAtomId>,
}

/// Application-supplied ordering of transparent records
///
/// `Ordering::Less` means `a` is drawn before `b`.
pub trait TransparencyComparator: Send + Sync {
    /// Compare two records
    fn compare(&self, a: &DepthSortKey, b: &DepthSortKey) -> Ordering;
}

/// View parameters the render bin snapshots each update
#[derive(Clone)]
pub struct ViewSettings {
    /// Index of the view, matched against `DrawAtom::view_mask`
    pub view_index: u32,
    /// Eye position in world space
    pub eye: Point3,
    /// Culling frustum in world space
    pub frustum: Frustum,
    /// Transparency sort mode
    pub sort_mode: TransparencySortMode,
    /// Transparency sort direction
    pub order: SortOrder,
    /// Disable depth writes while drawing transparent geometry
    pub freeze_depth_writes: bool,
    /// Overrides the distance ordering when set
    pub comparator: Option<Arc<dyn TransparencyComparator>>,
}

impl ViewSettings {
    /// View settings taking the transparency defaults from configuration
    pub fn from_config(config: &TransparencyConfig) -> Self {
        Self {
            view_index: 0,
            eye: Point3::origin(),
            frustum: Frustum::infinite(),
            sort_mode: config.sort_mode,
            order: config.order,
            freeze_depth_writes: config.freeze_depth_writes,
            comparator: None,
        }
    }

    /// Move the eye
    pub fn with_eye(mut self, eye: Point3) -> Self {
        self.eye = eye;
        self
    }

    /// Set the transparency sort mode
    pub fn with_sort_mode(mut self, mode: TransparencySortMode) -> Self {
        self.sort_mode = mode;
        self
    }

    /// Set the culling frustum
    pub fn with_frustum(mut self, frustum: Frustum) -> Self {
        self.frustum = frustum;
        self
    }

    /// Install a custom transparency comparator
    pub fn with_comparator(mut self, comparator: Arc<dyn TransparencyComparator>) -> Self {
        self.comparator = Some(comparator);
        self
    }

    /// Whether the depth ordering inputs differ from `other`
    pub fn sort_inputs_changed(&self, other: &Self) -> bool {
        self.eye != other.eye
            || self.order != other.order
            || match (&self.comparator, &other.comparator) {
                (None, None) => false,
                (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
                _ => true,
            }
    }
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self::from_config(&TransparencyConfig::default())
    }
}

impl fmt::Debug for ViewSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewSettings")
            .field("view_index", &self.view_index)
            .field("eye", &self.eye)
            .field("frustum", &self.frustum)
            .field("sort_mode", &self.sort_mode)
            .field("order", &self.order)
            .field("freeze_depth_writes", &self.freeze_depth_writes)
            .field("comparator", &self.comparator.is_some())
            .finish()
    }
}

/// Coarse visibility answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidates {
    /// Every registered atom is a candidate
    All,
    /// Only these atoms are candidates
    Only(HashSet<DrawAtomId>),
}

/// Result of a visibility query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibilityResult {
    /// Potentially visible atoms; the bin still culls them against the frustum
    pub candidates: Candidates,
    /// Whether any bounding-volume region changed since the last query
    pub changed: bool,
}

/// Visibility collaborator (bounding-volume tree, occlusion, ...)
pub trait VisibilityQuery: Send + Sync {
    /// Potentially visible atoms for a view at a reference time
    fn query(&self, view: &ViewSettings, reference_time: u64) -> VisibilityResult;
}

/// Treats every registered atom as a candidate
#[derive(Debug, Default, Clone, Copy)]
pub struct AllRegistered;

impl VisibilityQuery for AllRegistered {
    fn query(&self, _view: &ViewSettings, _reference_time: u64) -> VisibilityResult {
        VisibilityResult {
            candidates: Candidates::All,
            changed: false,
        }
    }
}

/// Explicit candidate set, changed by the owner between frames
#[derive(Debug, Default)]
pub struct CandidateSet {
    visible: Mutex<HashSet<DrawAtomId>>,
    changed: AtomicBool,
}

impl CandidateSet {
    /// Empty candidate set
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the candidate set
    pub fn set(&self, atoms: impl IntoIterator<Item = DrawAtomId>) {
        *self.visible.lock() = atoms.into_iter().collect();
        self.changed.store(true, AtomicOrdering::Release);
    }

    /// Add one candidate
    pub fn show(&self, atom: DrawAtomId) {
        self.visible.lock().insert(atom);
        self.changed.store(true, AtomicOrdering::Release);
    }

    /// Remove one candidate
    pub fn hide(&self, atom: DrawAtomId) {
        self.visible.lock().remove(&atom);
        self.changed.store(true, AtomicOrdering::Release);
    }
}

impl VisibilityQuery for CandidateSet {
    fn query(&self, _view: &ViewSettings, _reference_time: u64) -> VisibilityResult {
        VisibilityResult {
            candidates: Candidates::Only(self.visible.lock().clone()),
            changed: self.changed.swap(false, AtomicOrdering::AcqRel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reverse;

    impl TransparencyComparator for Reverse {
        fn compare(&self, a: &DepthSortKey, b: &DepthSortKey) -> Ordering {
            a.depth.total_cmp(&b.depth)
        }
    }

    #[test]
    fn test_candidate_set_reports_changes_once() {
        let set = CandidateSet::new();
        set.set([DrawAtomId(1), DrawAtomId(2)]);
        let view = ViewSettings::default();
        let first = set.query(&view, 0);
        assert!(first.changed);
        assert_eq!(first.candidates, Candidates::Only([DrawAtomId(1), DrawAtomId(2)].into_iter().collect()));
        assert!(!set.query(&view, 1).changed);
    }

    #[test]
    fn test_sort_inputs_changed() {
        let base = ViewSettings::default();
        assert!(!base.sort_inputs_changed(&base.clone()));
        assert!(base.sort_inputs_changed(&base.clone().with_eye(Point3::new(1.0, 0.0, 0.0))));
        assert!(base.sort_inputs_changed(&base.clone().with_comparator(Arc::new(Reverse))));
    }
}
