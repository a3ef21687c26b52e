//! Render atoms: a draw atom bound to one view's bin hierarchy

use std::sync::Arc;

use crate::foundation::collections::{Linked, Links};
use crate::foundation::math::{Bounds, Mat4, Point3};
use crate::render::bins::{AtomKey, BinChain};
use crate::render::flags::AtomFlags;
use crate::render::resources::DeviceResource;
use crate::render::transparency::TransparentKey;
use crate::scene::{Appearance, DrawAtom, DrawAtomId, Geometry, ResolvedEnvironment};

/// Externally visible lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomState {
    /// Not part of the visible set
    NotVisible,
    /// Visible, waiting for the next update to be classified
    VisibleNotInBin,
    /// Linked into a render molecule
    InBin,
    /// Will be unlinked by the next update
    PendingRemoval,
}

/// Per-geometry-piece cache
#[derive(Debug, Clone)]
pub struct RenderAtomListInfo {
    /// The piece
    pub geometry: Arc<Geometry>,
    /// Piece bounds in world coordinates
    pub world_bounds: Bounds,
    /// Dedicated draw list when the geometry is reused by other atoms
    pub dedicated_list: Option<Arc<DeviceResource>>,
    /// Depth-sort record while sorting per piece
    pub transparent: Option<TransparentKey>,
}

impl RenderAtomListInfo {
    fn new(geometry: Arc<Geometry>, local_to_world: &Mat4) -> Self {
        Self {
            world_bounds: geometry.bounds.transformed(local_to_world),
            geometry,
            dedicated_list: None,
            transparent: None,
        }
    }

    /// Depth-sort centroid
    pub fn centroid(&self) -> Point3 {
        self.world_bounds.center()
    }
}

/// A draw atom's binding into the bin hierarchy of one view
#[derive(Debug)]
pub struct RenderAtom {
    /// Source draw atom
    pub draw_atom: Arc<DrawAtom>,
    /// Lifecycle and dirty flags
    pub flags: AtomFlags,
    /// Siblings in the molecule list
    pub links: Links<AtomKey>,
    /// Bins the atom is linked under; `Some` exactly when `IN_BIN` is set
    pub chain: Option<BinChain>,
    /// Cached resolved environment
    pub environment: ResolvedEnvironment,
    /// Effective appearance snapshot (alternate appearance applied)
    pub appearance: Arc<Appearance>,
    /// One entry per geometry piece
    pub pieces: Vec<RenderAtomListInfo>,
    /// Last frame the atom was in the visible set
    pub last_visible_frame: u64,
}

impl RenderAtom {
    /// Bind `draw_atom` with the given world transform
    pub fn new(draw_atom: Arc<DrawAtom>, local_to_world: &Mat4, frame: u64) -> Self {
        let mut flags = AtomFlags::empty();
        flags.set(AtomFlags::IS_ORIENTED, draw_atom.oriented);
        flags.set(AtomFlags::IN_ORDERED, draw_atom.ordered_path.is_some());
        let pieces = draw_atom
            .geometry
            .iter()
            .map(|g| RenderAtomListInfo::new(Arc::clone(g), local_to_world))
            .collect();
        let appearance = draw_atom.appearance.clone().unwrap_or_default();
        Self {
            draw_atom,
            flags,
            links: Links::default(),
            chain: None,
            environment: ResolvedEnvironment::default(),
            appearance,
            pieces,
            last_visible_frame: frame,
        }
    }

    /// Draw atom identity
    pub fn id(&self) -> DrawAtomId {
        self.draw_atom.id
    }

    /// Lifecycle state derived from the flags
    pub fn state(&self) -> AtomState {
        if self.flags.contains(AtomFlags::PENDING_REMOVAL) {
            AtomState::PendingRemoval
        } else if self.flags.contains(AtomFlags::IN_BIN) {
            AtomState::InBin
        } else if self.flags.contains(AtomFlags::VISIBLE) {
            AtomState::VisibleNotInBin
        } else {
            AtomState::NotVisible
        }
    }

    /// Whether the atom goes through the blended path
    pub fn is_transparent(&self) -> bool {
        Self::classify_transparent(&self.appearance, &self.draw_atom)
    }

    /// Blended appearance, or per-vertex alpha that is not ignored
    pub fn classify_transparent(appearance: &Appearance, draw_atom: &DrawAtom) -> bool {
        appearance.is_blended()
            || (appearance.uses_vertex_colors() && draw_atom.geometry.iter().any(|g| g.has_vertex_alpha))
    }

    /// Pieces are compiled into the molecule's shared draw list
    ///
    /// Oriented atoms, dynamic geometry and pieces with a dedicated list
    /// are drawn individually.
    pub fn in_molecule_list(&self) -> bool {
        !self.flags.contains(AtomFlags::IS_ORIENTED)
            && !self.pieces.is_empty()
            && self
                .pieces
                .iter()
                .all(|p| p.geometry.compilable && p.dedicated_list.is_none())
    }

    /// Replace the draw atom, rebuilding the piece caches
    ///
    /// Depth-sort records and dedicated lists must already be released.
    pub fn rebind(&mut self, draw_atom: Arc<DrawAtom>, local_to_world: &Mat4) {
        debug_assert!(self.pieces.iter().all(|p| p.transparent.is_none()));
        self.pieces = draw_atom
            .geometry
            .iter()
            .map(|g| RenderAtomListInfo::new(Arc::clone(g), local_to_world))
            .collect();
        self.flags.set(AtomFlags::IS_ORIENTED, draw_atom.oriented);
        self.flags.set(AtomFlags::IN_ORDERED, draw_atom.ordered_path.is_some());
        self.draw_atom = draw_atom;
    }

    /// Recompute world bounds after a transform change
    pub fn update_world_bounds(&mut self, local_to_world: &Mat4) {
        for piece in &mut self.pieces {
            piece.world_bounds = piece.geometry.bounds.transformed(local_to_world);
        }
    }

    /// Union of the piece bounds in world coordinates
    pub fn world_bounds(&self) -> Option<Bounds> {
        let mut pieces = self.pieces.iter();
        let first = pieces.next()?.world_bounds;
        Some(pieces.fold(first, |acc, p| acc.union(&p.world_bounds)))
    }
}

impl Linked<AtomKey> for RenderAtom {
    fn links(&self) -> &Links<AtomKey> {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links<AtomKey> {
        &mut self.links
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;
    use crate::scene::{Component, TransparencyAttributes};
    use approx::assert_relative_eq;

    fn atom_with_piece(alpha: bool) -> DrawAtom {
        let mut geometry = Geometry::triangles(1, Bounds::from_center_extents(Point3::origin(), Vec3::new(1.0, 1.0, 1.0)));
        if alpha {
            geometry = geometry.with_vertex_alpha();
        }
        DrawAtom::new(1, vec![Arc::new(geometry)])
    }

    #[test]
    fn test_state_follows_flags() {
        let mut atom = RenderAtom::new(Arc::new(atom_with_piece(false)), &Mat4::identity(), 0);
        assert_eq!(atom.state(), AtomState::NotVisible);
        atom.flags.insert(AtomFlags::VISIBLE);
        assert_eq!(atom.state(), AtomState::VisibleNotInBin);
        atom.flags.insert(AtomFlags::IN_BIN);
        assert_eq!(atom.state(), AtomState::InBin);
        atom.flags.insert(AtomFlags::PENDING_REMOVAL);
        assert_eq!(atom.state(), AtomState::PendingRemoval);
    }

    #[test]
    fn test_vertex_alpha_makes_atom_transparent() {
        let atom = RenderAtom::new(Arc::new(atom_with_piece(true)), &Mat4::identity(), 0);
        assert!(atom.is_transparent());
        let opaque = RenderAtom::new(Arc::new(atom_with_piece(false)), &Mat4::identity(), 0);
        assert!(!opaque.is_transparent());

        let blended = atom_with_piece(false)
            .with_appearance(Arc::new(Appearance::default().with_transparency(Component::shared(
                1,
                TransparencyAttributes::blended(0.5),
            ))));
        assert!(RenderAtom::new(Arc::new(blended), &Mat4::identity(), 0).is_transparent());
    }

    #[test]
    fn test_world_bounds_follow_transform() {
        let mut atom = RenderAtom::new(Arc::new(atom_with_piece(false)), &Mat4::identity(), 0);
        atom.update_world_bounds(&Mat4::new_translation(&Vec3::new(10.0, 0.0, 0.0)));
        let bounds = atom.world_bounds().unwrap();
        assert_relative_eq!(bounds.center().x, 10.0);
        assert_relative_eq!(atom.pieces[0].centroid().x, 10.0);
    }
}
