//! Named flag sets for atoms, staging and canvases

use bitflags::bitflags;

bitflags! {
    /// Lifecycle and dirty state of a render atom
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AtomFlags: u32 {
        /// Passed the visibility test this frame
        const VISIBLE = 1 << 0;
        /// Linked into a render molecule
        const IN_BIN = 1 << 1;
        /// Scheduled to leave the bins in the next update
        const PENDING_REMOVAL = 1 << 2;
        /// Transform is re-oriented toward the viewer every frame
        const IS_ORIENTED = 1 << 3;
        /// Has records on the depth-sorted transparency list
        const IN_DEPTH_SORT_LIST = 1 << 4;
        /// Classified as transparent
        const TRANSPARENT = 1 << 5;
        /// Lives under an ordered group
        const IN_ORDERED = 1 << 6;
        /// Background geometry
        const BACKGROUND = 1 << 7;
        /// Switched off by a switch node
        const SWITCHED_OFF = 1 << 8;
    }
}

bitflags! {
    /// Categories of environment that must be re-resolved for live atoms
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Reevaluate: u32 {
        /// Light scopes/bounds changed
        const LIGHTS = 1 << 0;
        /// Fog scopes/bounds changed
        const FOG = 1 << 1;
        /// Model clip scopes/bounds changed
        const MODEL_CLIP = 1 << 2;
        /// Alternate appearance scopes changed
        const ALTERNATE_APPEARANCE = 1 << 3;
    }
}

impl Reevaluate {
    /// More than one category changed, so every category is compared
    pub fn needs_full_pass(self) -> bool {
        self.bits().count_ones() > 1
    }
}

bitflags! {
    /// Coarse staging state collected while draining messages
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StagingDirty: u32 {
        /// The visible set must be recomputed
        const VISIBILITY = 1 << 0;
        /// View settings changed
        const VIEW = 1 << 1;
        /// Background changed
        const BACKGROUND = 1 << 2;
        /// Light/fog/clip contents changed
        const ENVIRONMENT = 1 << 3;
        /// Ordered group structure changed
        const ORDERED = 1 << 4;
        /// Depth-sort inputs changed for every record
        const RESORT_ALL = 1 << 5;
    }
}

bitflags! {
    /// Per-canvas state the render thread must re-issue
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CanvasDirty: u32 {
        /// Light contents changed
        const LIGHTS = 1 << 0;
        /// Fog contents changed
        const FOG = 1 << 1;
        /// Model clip contents changed
        const MODEL_CLIP = 1 << 2;
        /// Background changed
        const BACKGROUND = 1 << 3;
        /// View changed
        const VIEW = 1 << 4;
        /// Texture contents changed
        const TEXTURES = 1 << 5;
        /// Bin hierarchy changed
        const BINS = 1 << 6;
        /// Local-to-world transforms changed
        const TRANSFORMS = 1 << 7;
    }
}
