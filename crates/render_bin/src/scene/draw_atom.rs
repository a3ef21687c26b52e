//! Draw atoms: the drawable units produced by scene-graph shapes
//!
//! A [`DrawAtom`] is owned by its shape and shared read-only (through `Arc`)
//! by every render atom derived from it.

use std::sync::Arc;

use crate::foundation::math::{Bounds, Mat4};
use crate::scene::appearance::Appearance;

/// Identity of a draw atom
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DrawAtomId(pub u64);

/// Identity of the shape a draw atom came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeId(pub u64);

/// Identity of the transform group whose local-to-world transform applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransformGroupId(pub u64);

/// Identity of a geometry object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryId(pub u64);

/// Identity of an ordered group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderedGroupId(pub u64);

/// Primitive type of a geometry piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GeometryKind {
    /// Triangle lists/strips
    #[default]
    Triangles,
    /// Line lists/strips
    Lines,
    /// Point lists
    Points,
}

/// One geometry piece of a draw atom
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    /// Geometry object identity; shared geometry keeps its id
    pub id: GeometryId,
    /// Primitive type
    pub kind: GeometryKind,
    /// Bounds in local coordinates
    pub bounds: Bounds,
    /// Number of vertices
    pub vertex_count: u32,
    /// Per-vertex colours carry alpha
    pub has_vertex_alpha: bool,
    /// Contents never change, so the piece may be compiled into a draw list
    pub compilable: bool,
}

impl Geometry {
    /// A static triangle piece with the given local bounds
    pub fn triangles(id: u64, bounds: Bounds) -> Self {
        Self {
            id: GeometryId(id),
            kind: GeometryKind::Triangles,
            bounds,
            vertex_count: 3,
            has_vertex_alpha: false,
            compilable: true,
        }
    }

    /// Mark the piece as carrying per-vertex alpha
    pub fn with_vertex_alpha(mut self) -> Self {
        self.has_vertex_alpha = true;
        self
    }

    /// Mark the piece as dynamic (never compiled)
    pub fn dynamic(mut self) -> Self {
        self.compilable = false;
        self
    }
}

/// Position of an atom under (possibly nested) ordered groups, outermost first
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OrderedPath(pub Vec<(OrderedGroupId, usize)>);

impl OrderedPath {
    /// Path with a single ordered group
    pub fn single(group: OrderedGroupId, child: usize) -> Self {
        Self(vec![(group, child)])
    }

    /// Descend into a nested ordered group
    pub fn then(mut self, group: OrderedGroupId, child: usize) -> Self {
        self.0.push((group, child));
        self
    }
}

/// The unit of drawable geometry derived from one shape
#[derive(Debug, Clone)]
pub struct DrawAtom {
    /// Identity
    pub id: DrawAtomId,
    /// Source shape
    pub shape: ShapeId,
    /// Geometry pieces
    pub geometry: Vec<Arc<Geometry>>,
    /// Shape appearance; `None` means default state at every bin level
    pub appearance: Option<Arc<Appearance>>,
    /// Transform group supplying the local-to-world transform
    pub transform_group: TransformGroupId,
    /// Local-to-world transform at creation
    pub local_to_world: Mat4,
    /// Shape visibility flag
    pub visible: bool,
    /// Transform is re-oriented toward the viewer every frame
    pub oriented: bool,
    /// Ordered group placement, if any
    pub ordered_path: Option<OrderedPath>,
    /// Views this atom belongs to, one bit per view index
    pub view_mask: u64,
}

impl DrawAtom {
    /// A visible atom with identity transform and default appearance
    pub fn new(id: u64, geometry: Vec<Arc<Geometry>>) -> Self {
        Self {
            id: DrawAtomId(id),
            shape: ShapeId(id),
            geometry,
            appearance: None,
            transform_group: TransformGroupId::default(),
            local_to_world: Mat4::identity(),
            visible: true,
            oriented: false,
            ordered_path: None,
            view_mask: u64::MAX,
        }
    }

    /// Set the appearance
    pub fn with_appearance(mut self, appearance: Arc<Appearance>) -> Self {
        self.appearance = Some(appearance);
        self
    }

    /// Place the atom under a transform group
    pub fn with_transform(mut self, group: TransformGroupId, local_to_world: Mat4) -> Self {
        self.transform_group = group;
        self.local_to_world = local_to_world;
        self
    }

    /// Place the atom under ordered groups
    pub fn in_ordered_group(mut self, path: OrderedPath) -> Self {
        self.ordered_path = Some(path);
        self
    }

    /// Mark the atom as viewer-oriented
    pub fn oriented(mut self) -> Self {
        self.oriented = true;
        self
    }

    /// Whether the atom belongs to the view with index `view_index`
    pub fn in_view(&self, view_index: u32) -> bool {
        view_index < 64 && self.view_mask & (1 << view_index) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_membership() {
        let mut atom = DrawAtom::new(1, Vec::new());
        assert!(atom.in_view(0));
        atom.view_mask = 0b10;
        assert!(!atom.in_view(0));
        assert!(atom.in_view(1));
        assert!(!atom.in_view(70));
    }

    #[test]
    fn test_nested_ordered_path() {
        let path = OrderedPath::single(OrderedGroupId(1), 2).then(OrderedGroupId(7), 0);
        assert_eq!(path.0.len(), 2);
        assert_eq!(path.0[1], (OrderedGroupId(7), 0));
    }
}
