//! Defining state of each bin level and its equivalence predicate

use std::sync::Arc;

use crate::render::resources::DeviceResource;
use crate::render::transparency::TransparentKey;
use crate::scene::{
    equivalent, Appearance, Component, DrawAtom, FogId, GeometryKind, LightId, Material, ModelClipId,
    PolygonAttributes, ResolvedEnvironment, TextureUnitState, TransformGroupId, TransparencyAttributes,
};

/// Enable-mask bit of light `slot`; slots past the mask width have none
pub fn slot_bit(slot: usize) -> u32 {
    u32::try_from(slot).ok().and_then(|s| 1u32.checked_shl(s)).unwrap_or(0)
}

/// Device light slots of a light bin, reference counted by environment sets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightSlots {
    slots: Vec<Option<(LightId, usize)>>,
}

impl LightSlots {
    /// `capacity` empty slots
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Distinct lights currently loaded
    pub fn used(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Slot holding `light`
    pub fn slot_of(&self, light: LightId) -> Option<usize> {
        self.slots.iter().position(|s| s.is_some_and(|(l, _)| l == light))
    }

    /// Whether adding `lights` keeps the union within capacity
    pub fn can_hold(&self, lights: &[LightId]) -> bool {
        let missing = lights.iter().filter(|l| self.slot_of(**l).is_none()).count();
        self.used() + missing <= self.capacity()
    }

    /// Reference `lights`, loading missing ones into free slots
    ///
    /// Returns the slot enable mask for this light set. Callers check
    /// [`Self::can_hold`] first.
    pub fn add(&mut self, lights: &[LightId]) -> (Vec<(usize, LightId)>, u32) {
        let mut assigned = Vec::with_capacity(lights.len());
        let mut mask = 0u32;
        for &light in lights {
            let slot = match self.slot_of(light) {
                Some(slot) => slot,
                None => match self.slots.iter().position(Option::is_none) {
                    Some(free) => free,
                    None => {
                        log::error!("Light bin over capacity while adding {light:?}");
                        continue;
                    }
                },
            };
            let entry = self.slots[slot].get_or_insert((light, 0));
            entry.1 += 1;
            assigned.push((slot, light));
            mask |= slot_bit(slot);
        }
        (assigned, mask)
    }

    /// Drop one reference to each of `lights`, freeing unreferenced slots
    pub fn remove(&mut self, lights: &[LightId]) {
        for &light in lights {
            let Some(slot) = self.slot_of(light) else {
                log::error!("Light {light:?} released from a light bin that does not hold it");
                continue;
            };
            if let Some(entry) = self.slots[slot].as_mut() {
                entry.1 -= 1;
                if entry.1 == 0 {
                    self.slots[slot] = None;
                }
            }
        }
    }
}

/// Resolved light/fog/clip combination of an environment set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentState {
    /// Sorted influencing lights
    pub lights: Vec<LightId>,
    /// Device slot of each light
    pub slots: Vec<(usize, LightId)>,
    /// One bit per enabled light slot
    pub enable_mask: u32,
    /// Fog
    pub fog: Option<FogId>,
    /// Model clip
    pub model_clip: Option<ModelClipId>,
}

impl EnvironmentState {
    /// Whether this set serves `environment`
    pub fn matches(&self, environment: &ResolvedEnvironment) -> bool {
        self.lights == environment.lights && self.fog == environment.fog && self.model_clip == environment.model_clip
    }

    /// Two sets represent the same environment
    pub fn same_class(&self, other: &Self) -> bool {
        self.lights == other.lights && self.fog == other.fog && self.model_clip == other.model_clip
    }
}

/// Texture units of a texture bin plus the texture records they hold
#[derive(Debug, Clone)]
pub struct TextureState {
    /// Texture units
    pub units: Vec<Component<TextureUnitState>>,
    /// One record per unit that binds a texture
    pub textures: Vec<Arc<DeviceResource>>,
    /// Record drawing the bin's transparent atoms while depth sorting is off
    pub transparent_record: Option<TransparentKey>,
}

/// Defining state of a render molecule
#[derive(Debug, Clone, PartialEq)]
pub struct MoleculeState {
    /// Material
    pub material: Option<Component<Material>>,
    /// Transparency attributes
    pub transparency: Option<Component<TransparencyAttributes>>,
    /// Polygon attributes
    pub polygon: Option<Component<PolygonAttributes>>,
    /// Primitive type of the atoms' geometry
    pub geometry_kind: GeometryKind,
    /// Transform group all member atoms share
    pub transform_group: TransformGroupId,
}

impl MoleculeState {
    /// Molecule state an atom with this appearance needs
    pub fn for_atom(appearance: &Appearance, draw_atom: &DrawAtom) -> Self {
        Self {
            material: appearance.material.clone(),
            transparency: appearance.transparency.clone(),
            polygon: appearance.polygon.clone(),
            geometry_kind: draw_atom.geometry.first().map(|g| g.kind).unwrap_or_default(),
            transform_group: draw_atom.transform_group,
        }
    }

    /// Level equivalence predicate
    pub fn equivalent(&self, other: &Self) -> bool {
        self.geometry_kind == other.geometry_kind
            && self.transform_group == other.transform_group
            && equivalent(self.material.as_ref(), other.material.as_ref())
            && equivalent(self.transparency.as_ref(), other.transparency.as_ref())
            && equivalent(self.polygon.as_ref(), other.polygon.as_ref())
    }

    /// Equivalent, but some sole-user component changed contents
    pub fn differs_in_place(&self, other: &Self) -> bool {
        self.material != other.material || self.transparency != other.transparency || self.polygon != other.polygon
    }

    /// Material to issue; default when absent
    pub fn material_or_default(&self) -> Material {
        self.material.as_ref().map(|m| m.value.clone()).unwrap_or_default()
    }

    /// Polygon attributes to issue; default when absent
    pub fn polygon_or_default(&self) -> PolygonAttributes {
        self.polygon.as_ref().map(|p| p.value.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_light_slots_refcount() {
        let mut slots = LightSlots::new(2);
        let (assigned, mask) = slots.add(&[LightId(1), LightId(2)]);
        assert_eq!(assigned.len(), 2);
        assert_eq!(mask, 0b11);
        assert!(slots.can_hold(&[LightId(1)]));
        assert!(!slots.can_hold(&[LightId(3)]));

        let (_, mask) = slots.add(&[LightId(2)]);
        assert_eq!(mask, 0b10);
        slots.remove(&[LightId(1), LightId(2)]);
        assert_eq!(slots.used(), 1);
        assert_eq!(slots.slot_of(LightId(2)), Some(1));
        assert!(slots.can_hold(&[LightId(3)]));
    }

    #[test]
    fn test_full_width_light_slots() {
        let lights: Vec<LightId> = (0..32).map(LightId).collect();
        let mut slots = LightSlots::new(32);
        let (assigned, mask) = slots.add(&lights);
        assert_eq!(assigned.len(), 32);
        assert_eq!(mask, u32::MAX);
        assert_eq!(slot_bit(31), 1 << 31);
        assert_eq!(slot_bit(32), 0);
    }

    #[test]
    fn test_molecule_equivalence_by_value() {
        let a = Appearance::default().with_material(Component::shared(1, Material::diffuse(1.0, 0.0, 0.0)));
        let b = Appearance::default().with_material(Component::shared(2, Material::diffuse(1.0, 0.0, 0.0)));
        let atom = DrawAtom::new(1, Vec::new());
        let sa = MoleculeState::for_atom(&a, &atom);
        let sb = MoleculeState::for_atom(&b, &atom);
        assert!(sa.equivalent(&sb));

        let other_group = DrawAtom::new(2, Vec::new()).with_transform(TransformGroupId(4), crate::foundation::math::Mat4::identity());
        assert!(!sa.equivalent(&MoleculeState::for_atom(&a, &other_group)));
    }
}
