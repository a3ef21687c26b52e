//! Equivalence-class bins
//!
//! ```text
//! Domain (scene | background | ordered collection)
//!   └── LightBin           light slots, bounded by max_lights
//!         └── EnvironmentSet    lights + fog + model clip
//!               └── AttributeBin      rendering attributes
//!                     └── ShaderBin         shader program
//!                           └── TextureBin        texture units
//!                                 └── RenderMolecule    material, transparency, polygon,
//!                                                       geometry kind, transform group
//!                                       └── RenderAtom (opaque | transparent list)
//! ```
//!
//! Every level lives in its own arena. A node keeps its live children and the
//! children created during the current update (`pending_children`); pending
//! children are merged into the live list before the update finishes, so a
//! render pass only ever walks live lists.

mod levels;
mod ordered;
mod tree;

pub use levels::{slot_bit, EnvironmentState, LightSlots, MoleculeState, TextureState};
pub use ordered::OrderedBin;
pub use tree::{BinCounts, BinTree, Placement, SoleUpdate};

use std::sync::Arc;

use crate::foundation::collections::{new_key_type, Key, Linked, Links, SiblingList};
use crate::render::resources::DeviceResource;
use crate::scene::{Component, RenderingAttributes, ShaderProgram};

new_key_type! {
    /// Handle of a render atom
    pub struct AtomKey;
    /// Handle of a light bin
    pub struct LightBinKey;
    /// Handle of an environment set
    pub struct EnvSetKey;
    /// Handle of an attribute bin
    pub struct AttributeBinKey;
    /// Handle of a shader bin
    pub struct ShaderBinKey;
    /// Handle of a texture bin
    pub struct TextureBinKey;
    /// Handle of a render molecule
    pub struct MoleculeKey;
    /// Handle of an ordered bin
    pub struct OrderedBinKey;
}

/// Where a light bin hangs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainId {
    /// Main scene
    Scene,
    /// Background geometry
    Background,
    /// One child collection of an ordered bin
    Ordered(OrderedBinKey, usize),
}

/// Root of a bin tree: light bins plus nested ordered bins
#[derive(Debug, Default)]
pub struct Domain {
    /// Live light bins
    pub light_bins: SiblingList<LightBinKey>,
    /// Light bins created this update
    pub pending_light_bins: SiblingList<LightBinKey>,
    /// Live ordered bins directly under this domain
    pub ordered: Vec<OrderedBinKey>,
    /// Ordered bins created this update
    pub pending_ordered: Vec<OrderedBinKey>,
}

impl Domain {
    /// Nothing hangs here any more
    pub fn is_empty(&self) -> bool {
        self.light_bins.is_empty()
            && self.pending_light_bins.is_empty()
            && self.ordered.is_empty()
            && self.pending_ordered.is_empty()
    }
}

/// A bin level node
#[derive(Debug)]
pub struct Bin<K: Key, P, C: Key, S> {
    /// Parent node
    pub parent: P,
    /// Siblings under the parent
    pub links: Links<K>,
    /// Still on the parent's pending list
    pub pending: bool,
    /// Defining state of the equivalence class
    pub state: S,
    /// Live children
    pub children: SiblingList<C>,
    /// Children created this update
    pub pending_children: SiblingList<C>,
    /// Render atoms below this node
    pub atom_count: usize,
}

impl<K: Key, P, C: Key, S> Bin<K, P, C, S> {
    /// New empty node on its parent's pending list
    pub fn new(parent: P, state: S) -> Self {
        Self {
            parent,
            links: Links::default(),
            pending: true,
            state,
            children: SiblingList::new(),
            pending_children: SiblingList::new(),
            atom_count: 0,
        }
    }

    /// No children at all, live or pending
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty() && self.pending_children.is_empty()
    }
}

impl<K: Key, P, C: Key, S> Linked<K> for Bin<K, P, C, S> {
    fn links(&self) -> &Links<K> {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links<K> {
        &mut self.links
    }
}

/// Groups environment sets within the light capacity
pub type LightBin = Bin<LightBinKey, DomainId, EnvSetKey, LightSlots>;

/// Groups attribute bins sharing lights, fog and model clip
pub type EnvironmentSet = Bin<EnvSetKey, LightBinKey, AttributeBinKey, EnvironmentState>;

/// Groups shader bins sharing rendering attributes
pub type AttributeBin = Bin<AttributeBinKey, EnvSetKey, ShaderBinKey, Option<Component<RenderingAttributes>>>;

/// Groups texture bins sharing a shader program
pub type ShaderBin = Bin<ShaderBinKey, AttributeBinKey, TextureBinKey, Option<Component<ShaderProgram>>>;

/// Groups molecules sharing texture units
pub type TextureBin = Bin<TextureBinKey, ShaderBinKey, MoleculeKey, TextureState>;

/// Terminal level: atoms drawn with identical device state
#[derive(Debug)]
pub struct RenderMolecule {
    /// Parent texture bin
    pub parent: TextureBinKey,
    /// Siblings under the texture bin
    pub links: Links<MoleculeKey>,
    /// Still on the parent's pending list
    pub pending: bool,
    /// Defining state
    pub state: MoleculeState,
    /// Opaque atoms
    pub opaque: SiblingList<AtomKey>,
    /// Transparent atoms
    pub transparent: SiblingList<AtomKey>,
    /// Atoms in either list
    pub atom_count: usize,
    /// Shared draw list compiled from the list-eligible opaque atoms
    pub draw_list: Option<Arc<DeviceResource>>,
}

impl RenderMolecule {
    /// New empty molecule on its parent's pending list
    pub fn new(parent: TextureBinKey, state: MoleculeState) -> Self {
        Self {
            parent,
            links: Links::default(),
            pending: true,
            state,
            opaque: SiblingList::new(),
            transparent: SiblingList::new(),
            atom_count: 0,
            draw_list: None,
        }
    }
}

impl Linked<MoleculeKey> for RenderMolecule {
    fn links(&self) -> &Links<MoleculeKey> {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links<MoleculeKey> {
        &mut self.links
    }
}

/// The bins an in-bin atom is linked under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinChain {
    /// Domain the light bin hangs in
    pub domain: DomainId,
    /// Light bin
    pub light_bin: LightBinKey,
    /// Environment set
    pub env_set: EnvSetKey,
    /// Attribute bin
    pub attribute_bin: AttributeBinKey,
    /// Shader bin
    pub shader_bin: ShaderBinKey,
    /// Texture bin
    pub texture_bin: TextureBinKey,
    /// Render molecule
    pub molecule: MoleculeKey,
    /// Linked on the molecule's transparent list
    pub transparent: bool,
}
