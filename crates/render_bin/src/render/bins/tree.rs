//! Bin tree: classification, removal, staging merge and release

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::foundation::collections::{Key, Linked, SiblingList, SlotMap};
use crate::render::atom::RenderAtom;
use crate::render::bins::{
    AtomKey, AttributeBin, AttributeBinKey, Bin, BinChain, Domain, DomainId, EnvSetKey, EnvironmentSet,
    EnvironmentState, LightBin, LightBinKey, LightSlots, MoleculeKey, MoleculeState, OrderedBin, OrderedBinKey,
    RenderMolecule, ShaderBin, ShaderBinKey, TextureBin, TextureBinKey, TextureState,
};
use crate::render::canvas::CanvasState;
use crate::render::flags::AtomFlags;
use crate::render::resources::ResourceRegistry;
use crate::scene::{
    equivalent, equivalent_units, same_sole_object, Appearance, AppearanceComponents, Component, DrawAtom,
    OrderedGroupId, OrderedPath, RenderingAttributes, ResolvedEnvironment, ShaderProgram, TextureUnitState,
};

/// Nodes that sit on a pending list until the staging merge
trait Pending {
    fn set_live(&mut self);
}

impl<K: Key, P, C: Key, S> Pending for Bin<K, P, C, S> {
    fn set_live(&mut self) {
        self.pending = false;
    }
}

impl Pending for RenderMolecule {
    fn set_live(&mut self) {
        self.pending = false;
    }
}

/// Parent whose pending list gained a child this update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParentRef {
    Domain(DomainId),
    LightBin(LightBinKey),
    EnvSet(EnvSetKey),
    AttributeBin(AttributeBinKey),
    ShaderBin(ShaderBinKey),
    TextureBin(TextureBinKey),
}

/// In-place state change of a bin whose component is a sole-user object
#[derive(Debug, Clone)]
pub enum SoleUpdate {
    /// New rendering attributes
    Rendering(AttributeBinKey, Option<Component<RenderingAttributes>>),
    /// New shader program contents
    Shader(ShaderBinKey, Option<Component<ShaderProgram>>),
    /// New texture units
    Textures(TextureBinKey, Vec<Component<TextureUnitState>>),
    /// New material / transparency / polygon contents
    Molecule(MoleculeKey, MoleculeState),
}

/// How an appearance change affects an in-bin atom
#[derive(Debug, Clone)]
pub enum Placement {
    /// Every level still matches; nothing to do
    Unchanged,
    /// Same bins; sole-user bins take the new contents
    InPlace(Vec<SoleUpdate>),
    /// Some level no longer matches: remove, then reinsert
    Reinsert,
}

/// Number of live nodes per level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinCounts {
    /// Light bins
    pub light_bins: usize,
    /// Environment sets
    pub env_sets: usize,
    /// Attribute bins
    pub attribute_bins: usize,
    /// Shader bins
    pub shader_bins: usize,
    /// Texture bins
    pub texture_bins: usize,
    /// Render molecules
    pub molecules: usize,
    /// Ordered bins
    pub ordered_bins: usize,
}

/// Domain roots: scene, background, and every ordered bin
#[derive(Debug, Default)]
pub struct Domains {
    scene: Domain,
    background: Domain,
    ordered: SlotMap<OrderedBinKey, OrderedBin>,
    index: HashMap<(DomainId, OrderedGroupId), OrderedBinKey>,
}

impl Domains {
    /// Domain by id
    pub fn get(&self, id: DomainId) -> Option<&Domain> {
        match id {
            DomainId::Scene => Some(&self.scene),
            DomainId::Background => Some(&self.background),
            DomainId::Ordered(key, child) => self.ordered.get(key)?.collections.get(child),
        }
    }

    fn get_mut(&mut self, id: DomainId) -> Option<&mut Domain> {
        match id {
            DomainId::Scene => Some(&mut self.scene),
            DomainId::Background => Some(&mut self.background),
            DomainId::Ordered(key, child) => self.ordered.get_mut(key)?.collections.get_mut(child),
        }
    }

    /// Ordered bin by key
    pub fn ordered(&self, key: OrderedBinKey) -> Option<&OrderedBin> {
        self.ordered.get(key)
    }

    /// Every domain id currently present
    pub fn ids(&self) -> Vec<DomainId> {
        let mut ids = vec![DomainId::Scene, DomainId::Background];
        for (key, bin) in &self.ordered {
            ids.extend((0..bin.collections.len()).map(|child| DomainId::Ordered(key, child)));
        }
        ids
    }
}

fn find_in<K: Key, T: Linked<K>>(
    arena: &SlotMap<K, T>,
    live: &SiblingList<K>,
    pending: &SiblingList<K>,
    mut matches: impl FnMut(&T) -> bool,
) -> Option<K> {
    live.iter(arena)
        .chain(pending.iter(arena))
        .find(|(_, node)| matches(node))
        .map(|(key, _)| key)
}

fn promote<K: Key, T: Linked<K> + Pending>(
    live: &mut SiblingList<K>,
    pending: &mut SiblingList<K>,
    arena: &mut SlotMap<K, T>,
) -> usize {
    let keys = pending.keys(arena);
    for key in &keys {
        if let Some(node) = arena.get_mut(*key) {
            node.set_live();
        }
    }
    live.append(arena, pending);
    keys.len()
}

fn unlink_child<PK: Key, PP, PS, K: Key, T: Linked<K>>(
    parents: &mut SlotMap<PK, Bin<PK, PP, K, PS>>,
    parent: PK,
    children: &mut SlotMap<K, T>,
    key: K,
    pending: bool,
) {
    if let Some(parent) = parents.get_mut(parent) {
        if pending {
            parent.pending_children.unlink(children, key);
        } else {
            parent.children.unlink(children, key);
        }
    }
}

fn all_distinct<T>(items: &[&T], same: impl Fn(&T, &T) -> bool) -> bool {
    items
        .iter()
        .enumerate()
        .all(|(i, a)| items[i + 1..].iter().all(|b| !same(*a, *b)))
}

/// Every bin level of one view
#[derive(Debug)]
pub struct BinTree {
    /// Light bins
    pub light_bins: SlotMap<LightBinKey, LightBin>,
    /// Environment sets
    pub env_sets: SlotMap<EnvSetKey, EnvironmentSet>,
    /// Attribute bins
    pub attribute_bins: SlotMap<AttributeBinKey, AttributeBin>,
    /// Shader bins
    pub shader_bins: SlotMap<ShaderBinKey, ShaderBin>,
    /// Texture bins
    pub texture_bins: SlotMap<TextureBinKey, TextureBin>,
    /// Render molecules
    pub molecules: SlotMap<MoleculeKey, RenderMolecule>,
    domains: Domains,
    max_lights: usize,
    pending_parents: Vec<ParentRef>,
    emptied: Vec<MoleculeKey>,
    touched: HashSet<MoleculeKey>,
}

impl BinTree {
    /// Empty tree whose light bins hold at most `max_lights` lights
    pub fn new(max_lights: usize) -> Self {
        Self {
            light_bins: SlotMap::with_key(),
            env_sets: SlotMap::with_key(),
            attribute_bins: SlotMap::with_key(),
            shader_bins: SlotMap::with_key(),
            texture_bins: SlotMap::with_key(),
            molecules: SlotMap::with_key(),
            domains: Domains::default(),
            max_lights,
            pending_parents: Vec::new(),
            emptied: Vec::new(),
            touched: HashSet::new(),
        }
    }

    /// Domain roots
    pub fn domains(&self) -> &Domains {
        &self.domains
    }

    /// Domain for an atom under ordered groups, creating ordered bins on demand
    pub fn ordered_domain(&mut self, path: &OrderedPath, tables: &HashMap<OrderedGroupId, Vec<usize>>) -> DomainId {
        let mut domain = DomainId::Scene;
        for &(group, child) in &path.0 {
            let key = if let Some(&key) = self.domains.index.get(&(domain, group)) {
                key
            } else {
                let key = self
                    .domains
                    .ordered
                    .insert(OrderedBin::new(group, domain, tables.get(&group).cloned()));
                self.domains.index.insert((domain, group), key);
                if let Some(parent) = self.domains.get_mut(domain) {
                    parent.pending_ordered.push(key);
                }
                self.pending_parents.push(ParentRef::Domain(domain));
                log::debug!("Created ordered bin for {group:?} under {domain:?}");
                key
            };
            if let Some(bin) = self.domains.ordered.get_mut(key) {
                bin.collection_mut(child);
            }
            domain = DomainId::Ordered(key, child);
        }
        domain
    }

    /// Replace the child-order table of every bin of `group`
    pub fn set_child_order(&mut self, group: OrderedGroupId, order: Option<Vec<usize>>) {
        for (_, bin) in self.domains.ordered.iter_mut().filter(|(_, b)| b.group == group) {
            bin.child_order.clone_from(&order);
        }
    }

    // Classification

    /// Link an atom into the unique bin chain matching its cached state
    ///
    /// Missing bins are created on their parent's pending list.
    pub fn insert(
        &mut self,
        atoms: &mut SlotMap<AtomKey, RenderAtom>,
        key: AtomKey,
        domain: DomainId,
        resources: &mut ResourceRegistry,
    ) -> Option<BinChain> {
        let atom = atoms.get(key)?;
        if atom.chain.is_some() {
            log::error!("Atom {:?} inserted while already in a bin", atom.id());
            debug_assert!(false, "duplicate bin membership");
            return atom.chain;
        }
        let environment = atom.environment.clone();
        let appearance = Arc::clone(&atom.appearance);
        let molecule_state = MoleculeState::for_atom(&appearance, &atom.draw_atom);
        let transparent = atom.is_transparent();

        let (light_bin, env_set) = self.environment_bins(domain, &environment)?;
        let attribute_bin = self.attribute_bin(env_set, appearance.rendering.as_ref())?;
        let shader_bin = self.shader_bin(attribute_bin, appearance.shader.as_ref())?;
        let texture_bin = self.texture_bin(shader_bin, &appearance.texture_units, resources)?;
        let molecule = self.molecule(texture_bin, molecule_state)?;

        let chain = BinChain {
            domain,
            light_bin,
            env_set,
            attribute_bin,
            shader_bin,
            texture_bin,
            molecule,
            transparent,
        };
        let node = self.molecules.get_mut(molecule)?;
        if transparent {
            node.transparent.push_back(atoms, key);
        } else {
            node.opaque.push_back(atoms, key);
        }
        node.atom_count += 1;
        self.count_atoms(&chain, true);
        self.touched.insert(molecule);

        let atom = atoms.get_mut(key)?;
        atom.chain = Some(chain);
        atom.flags.insert(AtomFlags::IN_BIN);
        Some(chain)
    }

    fn environment_bins(&mut self, domain_id: DomainId, env: &ResolvedEnvironment) -> Option<(LightBinKey, EnvSetKey)> {
        let domain = self.domains.get(domain_id)?;
        let mut candidates = domain.light_bins.keys(&self.light_bins);
        candidates.extend(domain.pending_light_bins.keys(&self.light_bins));

        for &light_bin in &candidates {
            let bin = self.light_bins.get(light_bin)?;
            if let Some(env_set) = find_in(&self.env_sets, &bin.children, &bin.pending_children, |e| e.state.matches(env)) {
                return Some((light_bin, env_set));
            }
        }

        let with_room = candidates
            .iter()
            .copied()
            .find(|&k| self.light_bins.get(k).is_some_and(|b| b.state.can_hold(&env.lights)));
        let light_bin = if let Some(light_bin) = with_room {
            light_bin
        } else {
            let light_bin = self
                .light_bins
                .insert(Bin::new(domain_id, LightSlots::new(self.max_lights)));
            self.domains
                .get_mut(domain_id)?
                .pending_light_bins
                .push_back(&mut self.light_bins, light_bin);
            self.pending_parents.push(ParentRef::Domain(domain_id));
            log::debug!("New light bin for {} lights in {domain_id:?}", env.lights.len());
            light_bin
        };

        let (slots, enable_mask) = self.light_bins.get_mut(light_bin)?.state.add(&env.lights);
        let env_set = self.env_sets.insert(Bin::new(
            light_bin,
            EnvironmentState {
                lights: env.lights.clone(),
                slots,
                enable_mask,
                fog: env.fog,
                model_clip: env.model_clip,
            },
        ));
        self.light_bins
            .get_mut(light_bin)?
            .pending_children
            .push_back(&mut self.env_sets, env_set);
        self.pending_parents.push(ParentRef::LightBin(light_bin));
        Some((light_bin, env_set))
    }

    fn attribute_bin(&mut self, env_set: EnvSetKey, rendering: Option<&Component<RenderingAttributes>>) -> Option<AttributeBinKey> {
        let parent = self.env_sets.get(env_set)?;
        if let Some(found) = find_in(&self.attribute_bins, &parent.children, &parent.pending_children, |b| {
            equivalent(b.state.as_ref(), rendering)
        }) {
            return Some(found);
        }
        let key = self.attribute_bins.insert(Bin::new(env_set, rendering.cloned()));
        self.env_sets
            .get_mut(env_set)?
            .pending_children
            .push_back(&mut self.attribute_bins, key);
        self.pending_parents.push(ParentRef::EnvSet(env_set));
        Some(key)
    }

    fn shader_bin(&mut self, attribute_bin: AttributeBinKey, shader: Option<&Component<ShaderProgram>>) -> Option<ShaderBinKey> {
        let parent = self.attribute_bins.get(attribute_bin)?;
        if let Some(found) = find_in(&self.shader_bins, &parent.children, &parent.pending_children, |b| {
            equivalent(b.state.as_ref(), shader)
        }) {
            return Some(found);
        }
        let key = self.shader_bins.insert(Bin::new(attribute_bin, shader.cloned()));
        self.attribute_bins
            .get_mut(attribute_bin)?
            .pending_children
            .push_back(&mut self.shader_bins, key);
        self.pending_parents.push(ParentRef::AttributeBin(attribute_bin));
        Some(key)
    }

    fn texture_bin(
        &mut self,
        shader_bin: ShaderBinKey,
        units: &[Component<TextureUnitState>],
        resources: &mut ResourceRegistry,
    ) -> Option<TextureBinKey> {
        let parent = self.shader_bins.get(shader_bin)?;
        if let Some(found) = find_in(&self.texture_bins, &parent.children, &parent.pending_children, |b| {
            equivalent_units(&b.state.units, units)
        }) {
            return Some(found);
        }
        let textures = units
            .iter()
            .filter_map(|u| u.value.texture)
            .map(|t| resources.acquire_texture(t))
            .collect();
        let state = TextureState {
            units: units.to_vec(),
            textures,
            transparent_record: None,
        };
        let key = self.texture_bins.insert(Bin::new(shader_bin, state));
        self.shader_bins
            .get_mut(shader_bin)?
            .pending_children
            .push_back(&mut self.texture_bins, key);
        self.pending_parents.push(ParentRef::ShaderBin(shader_bin));
        Some(key)
    }

    fn molecule(&mut self, texture_bin: TextureBinKey, state: MoleculeState) -> Option<MoleculeKey> {
        let parent = self.texture_bins.get(texture_bin)?;
        if let Some(found) = find_in(&self.molecules, &parent.children, &parent.pending_children, |m| {
            m.state.equivalent(&state)
        }) {
            return Some(found);
        }
        let key = self.molecules.insert(RenderMolecule::new(texture_bin, state));
        self.texture_bins
            .get_mut(texture_bin)?
            .pending_children
            .push_back(&mut self.molecules, key);
        self.pending_parents.push(ParentRef::TextureBin(texture_bin));
        Some(key)
    }

    fn count_atoms(&mut self, chain: &BinChain, add: bool) {
        fn step(count: &mut usize, add: bool) {
            if add {
                *count += 1;
            } else {
                debug_assert!(*count > 0, "bin atom count underflow");
                *count = count.saturating_sub(1);
            }
        }
        if let Some(b) = self.texture_bins.get_mut(chain.texture_bin) {
            step(&mut b.atom_count, add);
        }
        if let Some(b) = self.shader_bins.get_mut(chain.shader_bin) {
            step(&mut b.atom_count, add);
        }
        if let Some(b) = self.attribute_bins.get_mut(chain.attribute_bin) {
            step(&mut b.atom_count, add);
        }
        if let Some(b) = self.env_sets.get_mut(chain.env_set) {
            step(&mut b.atom_count, add);
        }
        if let Some(b) = self.light_bins.get_mut(chain.light_bin) {
            step(&mut b.atom_count, add);
        }
    }

    // Removal

    /// Fully unlink an atom from its molecule
    ///
    /// Bins left empty are only queued; [`Self::release_empty`] frees them
    /// once the update knows no reinsertion reuses them.
    pub fn remove(&mut self, atoms: &mut SlotMap<AtomKey, RenderAtom>, key: AtomKey) -> Option<BinChain> {
        let atom = atoms.get_mut(key)?;
        let chain = atom.chain.take()?;
        atom.flags.remove(AtomFlags::IN_BIN);

        let Some(molecule) = self.molecules.get_mut(chain.molecule) else {
            log::error!("Atom {key:?} referenced a released molecule");
            return Some(chain);
        };
        if chain.transparent {
            molecule.transparent.unlink(atoms, key);
        } else {
            molecule.opaque.unlink(atoms, key);
        }
        molecule.atom_count = molecule.atom_count.saturating_sub(1);
        if molecule.atom_count == 0 {
            self.emptied.push(chain.molecule);
        }
        self.count_atoms(&chain, false);
        self.touched.insert(chain.molecule);
        Some(chain)
    }

    /// Whether any molecule under `texture_bin` still holds transparent atoms
    pub fn has_transparent_atoms(&self, texture_bin: TextureBinKey) -> bool {
        let Some(bin) = self.texture_bins.get(texture_bin) else {
            return false;
        };
        bin.children
            .iter(&self.molecules)
            .chain(bin.pending_children.iter(&self.molecules))
            .any(|(_, m)| !m.transparent.is_empty())
    }

    /// Free every bin removal left empty; returns the number of nodes freed
    pub fn release_empty(&mut self, resources: &mut ResourceRegistry, canvases: &[Arc<CanvasState>]) -> usize {
        let mut released = 0;
        for key in std::mem::take(&mut self.emptied) {
            if self.molecules.get(key).is_some_and(|m| m.atom_count == 0) {
                released += self.release_molecule(key, resources, canvases);
            }
        }
        if released > 0 {
            log::debug!("Released {released} empty bins");
        }
        released
    }

    fn release_molecule(&mut self, key: MoleculeKey, resources: &mut ResourceRegistry, canvases: &[Arc<CanvasState>]) -> usize {
        let Some((parent, pending)) = self.molecules.get(key).map(|m| (m.parent, m.pending)) else {
            return 0;
        };
        unlink_child(&mut self.texture_bins, parent, &mut self.molecules, key, pending);
        if let Some(molecule) = self.molecules.remove(key) {
            if let Some(list) = molecule.draw_list {
                resources.retire(&list, canvases);
            }
        }
        self.touched.remove(&key);
        1 + self.release_texture_bin(parent, resources, canvases)
    }

    fn release_texture_bin(&mut self, key: TextureBinKey, resources: &mut ResourceRegistry, canvases: &[Arc<CanvasState>]) -> usize {
        let Some(bin) = self.texture_bins.get(key) else {
            return 0;
        };
        if bin.atom_count != 0 || !bin.is_leaf() {
            return 0;
        }
        let (parent, pending) = (bin.parent, bin.pending);
        unlink_child(&mut self.shader_bins, parent, &mut self.texture_bins, key, pending);
        if let Some(bin) = self.texture_bins.remove(key) {
            debug_assert!(bin.state.transparent_record.is_none(), "released texture bin still on the transparency list");
            for texture in bin.state.units.iter().filter_map(|u| u.value.texture) {
                resources.release_texture(texture, canvases);
            }
        }
        1 + self.release_shader_bin(parent)
    }

    fn release_shader_bin(&mut self, key: ShaderBinKey) -> usize {
        let Some(bin) = self.shader_bins.get(key) else {
            return 0;
        };
        if bin.atom_count != 0 || !bin.is_leaf() {
            return 0;
        }
        let (parent, pending) = (bin.parent, bin.pending);
        unlink_child(&mut self.attribute_bins, parent, &mut self.shader_bins, key, pending);
        self.shader_bins.remove(key);
        1 + self.release_attribute_bin(parent)
    }

    fn release_attribute_bin(&mut self, key: AttributeBinKey) -> usize {
        let Some(bin) = self.attribute_bins.get(key) else {
            return 0;
        };
        if bin.atom_count != 0 || !bin.is_leaf() {
            return 0;
        }
        let (parent, pending) = (bin.parent, bin.pending);
        unlink_child(&mut self.env_sets, parent, &mut self.attribute_bins, key, pending);
        self.attribute_bins.remove(key);
        1 + self.release_env_set(parent)
    }

    fn release_env_set(&mut self, key: EnvSetKey) -> usize {
        let Some(bin) = self.env_sets.get(key) else {
            return 0;
        };
        if bin.atom_count != 0 || !bin.is_leaf() {
            return 0;
        }
        let (parent, pending) = (bin.parent, bin.pending);
        unlink_child(&mut self.light_bins, parent, &mut self.env_sets, key, pending);
        if let Some(env_set) = self.env_sets.remove(key) {
            if let Some(light_bin) = self.light_bins.get_mut(parent) {
                light_bin.state.remove(&env_set.state.lights);
            }
        }
        1 + self.release_light_bin(parent)
    }

    fn release_light_bin(&mut self, key: LightBinKey) -> usize {
        let Some(bin) = self.light_bins.get(key) else {
            return 0;
        };
        if bin.atom_count != 0 || !bin.is_leaf() {
            return 0;
        }
        let (domain, pending) = (bin.parent, bin.pending);
        if let Some(root) = self.domains.get_mut(domain) {
            if pending {
                root.pending_light_bins.unlink(&mut self.light_bins, key);
            } else {
                root.light_bins.unlink(&mut self.light_bins, key);
            }
        }
        self.light_bins.remove(key);
        1 + self.release_ordered(domain)
    }

    fn release_ordered(&mut self, domain: DomainId) -> usize {
        let DomainId::Ordered(key, _) = domain else {
            return 0;
        };
        let Some(bin) = self.domains.ordered.get(key) else {
            return 0;
        };
        if !bin.is_empty() {
            return 0;
        }
        let (parent, group) = (bin.parent, bin.group);
        if let Some(root) = self.domains.get_mut(parent) {
            root.ordered.retain(|k| *k != key);
            root.pending_ordered.retain(|k| *k != key);
        }
        self.domains.index.remove(&(parent, group));
        self.domains.ordered.remove(key);
        log::debug!("Released ordered bin for {group:?}");
        1 + self.release_ordered(parent)
    }

    // Staging merge

    /// Move every pending child onto its parent's live list
    pub fn merge_pending(&mut self) -> usize {
        let mut merged = 0;
        for parent in std::mem::take(&mut self.pending_parents) {
            merged += match parent {
                ParentRef::Domain(id) => self.merge_domain(id),
                ParentRef::LightBin(k) => match self.light_bins.get_mut(k) {
                    Some(b) => promote(&mut b.children, &mut b.pending_children, &mut self.env_sets),
                    None => 0,
                },
                ParentRef::EnvSet(k) => match self.env_sets.get_mut(k) {
                    Some(b) => promote(&mut b.children, &mut b.pending_children, &mut self.attribute_bins),
                    None => 0,
                },
                ParentRef::AttributeBin(k) => match self.attribute_bins.get_mut(k) {
                    Some(b) => promote(&mut b.children, &mut b.pending_children, &mut self.shader_bins),
                    None => 0,
                },
                ParentRef::ShaderBin(k) => match self.shader_bins.get_mut(k) {
                    Some(b) => promote(&mut b.children, &mut b.pending_children, &mut self.texture_bins),
                    None => 0,
                },
                ParentRef::TextureBin(k) => match self.texture_bins.get_mut(k) {
                    Some(b) => promote(&mut b.children, &mut b.pending_children, &mut self.molecules),
                    None => 0,
                },
            };
        }
        merged
    }

    fn merge_domain(&mut self, id: DomainId) -> usize {
        let Some(root) = self.domains.get_mut(id) else {
            return 0;
        };
        let new_ordered = std::mem::take(&mut root.pending_ordered);
        let mut merged = promote(&mut root.light_bins, &mut root.pending_light_bins, &mut self.light_bins);
        for key in &new_ordered {
            if let Some(bin) = self.domains.ordered.get_mut(*key) {
                bin.pending = false;
            }
        }
        merged += new_ordered.len();
        if let Some(root) = self.domains.get_mut(id) {
            root.ordered.extend(new_ordered);
        }
        merged
    }

    // Appearance changes

    /// Decide how new appearance contents affect an atom linked under `chain`
    ///
    /// Only the levels named in `components` are compared.
    pub fn placement(
        &self,
        chain: &BinChain,
        appearance: &Appearance,
        draw_atom: &DrawAtom,
        components: AppearanceComponents,
    ) -> Placement {
        let mut updates = Vec::new();

        if components.contains(AppearanceComponents::RENDERING) {
            let Some(bin) = self.attribute_bins.get(chain.attribute_bin) else {
                return Placement::Reinsert;
            };
            let new = appearance.rendering.as_ref();
            if !equivalent(bin.state.as_ref(), new) {
                return Placement::Reinsert;
            }
            if same_sole_object(bin.state.as_ref(), new) && bin.state.as_ref() != new {
                updates.push(SoleUpdate::Rendering(chain.attribute_bin, new.cloned()));
            }
        }

        if components.contains(AppearanceComponents::SHADER) {
            let Some(bin) = self.shader_bins.get(chain.shader_bin) else {
                return Placement::Reinsert;
            };
            let new = appearance.shader.as_ref();
            if !equivalent(bin.state.as_ref(), new) {
                return Placement::Reinsert;
            }
            if same_sole_object(bin.state.as_ref(), new) && bin.state.as_ref() != new {
                updates.push(SoleUpdate::Shader(chain.shader_bin, new.cloned()));
            }
        }

        if components.contains(AppearanceComponents::TEXTURE) {
            let Some(bin) = self.texture_bins.get(chain.texture_bin) else {
                return Placement::Reinsert;
            };
            let new = &appearance.texture_units;
            if !equivalent_units(&bin.state.units, new) {
                return Placement::Reinsert;
            }
            let sole_changed = bin
                .state
                .units
                .iter()
                .zip(new)
                .any(|(old, new)| same_sole_object(Some(old), Some(new)) && old != new);
            if sole_changed {
                updates.push(SoleUpdate::Textures(chain.texture_bin, new.clone()));
            }
        }

        let molecule_parts =
            AppearanceComponents::MATERIAL | AppearanceComponents::TRANSPARENCY | AppearanceComponents::POLYGON;
        if components.intersects(molecule_parts) {
            let Some(molecule) = self.molecules.get(chain.molecule) else {
                return Placement::Reinsert;
            };
            let state = MoleculeState::for_atom(appearance, draw_atom);
            if !molecule.state.equivalent(&state) {
                return Placement::Reinsert;
            }
            if molecule.state.differs_in_place(&state) {
                let sole = same_sole_object(molecule.state.material.as_ref(), state.material.as_ref())
                    || same_sole_object(molecule.state.transparency.as_ref(), state.transparency.as_ref())
                    || same_sole_object(molecule.state.polygon.as_ref(), state.polygon.as_ref());
                if sole {
                    updates.push(SoleUpdate::Molecule(chain.molecule, state));
                }
            }
        }

        if updates.is_empty() {
            Placement::Unchanged
        } else {
            Placement::InPlace(updates)
        }
    }

    /// Apply a queued sole-user update; `false` if the bin is gone
    pub fn apply_sole_update(
        &mut self,
        update: SoleUpdate,
        resources: &mut ResourceRegistry,
        canvases: &[Arc<CanvasState>],
    ) -> bool {
        match update {
            SoleUpdate::Rendering(key, state) => self.attribute_bins.get_mut(key).map(|b| b.state = state).is_some(),
            SoleUpdate::Shader(key, state) => self.shader_bins.get_mut(key).map(|b| b.state = state).is_some(),
            SoleUpdate::Molecule(key, state) => self.molecules.get_mut(key).map(|m| m.state = state).is_some(),
            SoleUpdate::Textures(key, units) => {
                let Some(bin) = self.texture_bins.get_mut(key) else {
                    return false;
                };
                let old: Vec<_> = bin.state.units.iter().filter_map(|u| u.value.texture).collect();
                bin.state.textures = units
                    .iter()
                    .filter_map(|u| u.value.texture)
                    .map(|t| resources.acquire_texture(t))
                    .collect();
                bin.state.units = units;
                for texture in old {
                    resources.release_texture(texture, canvases);
                }
                true
            }
        }
    }

    /// Molecules whose membership changed since the last call
    pub fn take_touched(&mut self) -> Vec<MoleculeKey> {
        self.touched
            .drain()
            .filter(|k| self.molecules.contains_key(*k))
            .collect()
    }

    /// Node counts per level
    pub fn counts(&self) -> BinCounts {
        BinCounts {
            light_bins: self.light_bins.len(),
            env_sets: self.env_sets.len(),
            attribute_bins: self.attribute_bins.len(),
            shader_bins: self.shader_bins.len(),
            texture_bins: self.texture_bins.len(),
            molecules: self.molecules.len(),
            ordered_bins: self.domains.ordered.len(),
        }
    }

    // Invariant checks

    /// Check sibling uniqueness, parent links, light capacity and atom
    /// membership; the first violation found is returned
    pub fn verify(&self, atoms: &SlotMap<AtomKey, RenderAtom>) -> Result<(), String> {
        if !self.pending_parents.is_empty() {
            return Err("pending bins were not merged".into());
        }
        for domain_id in self.domains.ids() {
            let Some(domain) = self.domains.get(domain_id) else {
                continue;
            };
            let mut env_states = Vec::new();
            for (lk, light_bin) in domain.light_bins.iter(&self.light_bins) {
                if light_bin.parent != domain_id {
                    return Err(format!("light bin {lk:?} has the wrong domain"));
                }
                if light_bin.state.used() > self.max_lights {
                    return Err(format!("light bin {lk:?} exceeds {} lights", self.max_lights));
                }
                for (ek, env_set) in light_bin.children.iter(&self.env_sets) {
                    if env_set.parent != lk {
                        return Err(format!("environment set {ek:?} has the wrong parent"));
                    }
                    env_states.push(&env_set.state);
                    self.verify_env_set(ek, env_set)?;
                }
            }
            if !all_distinct(&env_states, EnvironmentState::same_class) {
                return Err(format!("duplicate environment sets in {domain_id:?}"));
            }
        }

        for (key, atom) in atoms {
            let in_bin = atom.flags.contains(AtomFlags::IN_BIN);
            match (&atom.chain, in_bin) {
                (None, false) => {}
                (Some(chain), true) => self.verify_chain(atoms, key, atom, chain)?,
                _ => return Err(format!("atom {:?} membership and IN_BIN disagree", atom.id())),
            }
        }
        Ok(())
    }

    fn verify_env_set(&self, key: EnvSetKey, env_set: &EnvironmentSet) -> Result<(), String> {
        let attributes: Vec<_> = env_set.children.iter(&self.attribute_bins).collect();
        let states: Vec<_> = attributes.iter().map(|(_, b)| &b.state).collect();
        if !all_distinct(&states, |a, b| equivalent(a.as_ref(), b.as_ref())) {
            return Err(format!("duplicate attribute bins under {key:?}"));
        }
        for (ak, attribute_bin) in attributes {
            if attribute_bin.parent != key {
                return Err(format!("attribute bin {ak:?} has the wrong parent"));
            }
            let shaders: Vec<_> = attribute_bin.children.iter(&self.shader_bins).collect();
            let states: Vec<_> = shaders.iter().map(|(_, b)| &b.state).collect();
            if !all_distinct(&states, |a, b| equivalent(a.as_ref(), b.as_ref())) {
                return Err(format!("duplicate shader bins under {ak:?}"));
            }
            for (sk, shader_bin) in shaders {
                if shader_bin.parent != ak {
                    return Err(format!("shader bin {sk:?} has the wrong parent"));
                }
                let textures: Vec<_> = shader_bin.children.iter(&self.texture_bins).collect();
                let states: Vec<_> = textures.iter().map(|(_, b)| &b.state.units).collect();
                if !all_distinct(&states, |a, b| equivalent_units(a, b)) {
                    return Err(format!("duplicate texture bins under {sk:?}"));
                }
                for (tk, texture_bin) in textures {
                    if texture_bin.parent != sk {
                        return Err(format!("texture bin {tk:?} has the wrong parent"));
                    }
                    let molecules: Vec<_> = texture_bin.children.iter(&self.molecules).collect();
                    let states: Vec<_> = molecules.iter().map(|(_, m)| &m.state).collect();
                    if !all_distinct(&states, MoleculeState::equivalent) {
                        return Err(format!("duplicate molecules under {tk:?}"));
                    }
                    for (mk, molecule) in molecules {
                        if molecule.parent != tk {
                            return Err(format!("molecule {mk:?} has the wrong parent"));
                        }
                        if molecule.atom_count != molecule.opaque.len() + molecule.transparent.len() {
                            return Err(format!("molecule {mk:?} atom count is stale"));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn verify_chain(
        &self,
        atoms: &SlotMap<AtomKey, RenderAtom>,
        key: AtomKey,
        atom: &RenderAtom,
        chain: &BinChain,
    ) -> Result<(), String> {
        let id = atom.id();
        let molecule = self
            .molecules
            .get(chain.molecule)
            .ok_or_else(|| format!("atom {id:?} points at a released molecule"))?;
        let list = if chain.transparent { &molecule.transparent } else { &molecule.opaque };
        if !list.iter(atoms).any(|(k, _)| k == key) {
            return Err(format!("atom {id:?} is not on its molecule's list"));
        }
        let linked = molecule.parent == chain.texture_bin
            && self.texture_bins.get(chain.texture_bin).map(|b| b.parent) == Some(chain.shader_bin)
            && self.shader_bins.get(chain.shader_bin).map(|b| b.parent) == Some(chain.attribute_bin)
            && self.attribute_bins.get(chain.attribute_bin).map(|b| b.parent) == Some(chain.env_set)
            && self.env_sets.get(chain.env_set).map(|b| b.parent) == Some(chain.light_bin)
            && self.light_bins.get(chain.light_bin).map(|b| b.parent) == Some(chain.domain);
        if !linked {
            return Err(format!("atom {id:?} has a broken bin chain"));
        }
        let env_matches = self
            .env_sets
            .get(chain.env_set)
            .is_some_and(|e| e.state.matches(&atom.environment));
        if !env_matches {
            return Err(format!("atom {id:?} sits in an environment set that does not match its lights"));
        }
        Ok(())
    }
}
