//! Lights, fog, model clip and background, plus the resolver collaborator
//!
//! The scene graph decides which lights/fog/clip planes influence an atom;
//! the render bin only asks through [`EnvironmentResolver`] and groups atoms
//! whose answers match into the same environment set.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::foundation::math::{Plane, Point3, Vec3};
use crate::scene::appearance::Appearance;
use crate::scene::draw_atom::{DrawAtom, DrawAtomId};
use crate::scene::view::ViewSettings;

/// Identity of a light
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LightId(pub u64);

/// Identity of a fog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FogId(pub u64);

/// Identity of a model clip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelClipId(pub u64);

/// Light types
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightKind {
    /// Ambient light
    Ambient,
    /// Directional light (like sunlight)
    Directional {
        /// Light direction
        direction: Vec3,
    },
    /// Point light (like a lightbulb)
    Point {
        /// Light position
        position: Point3,
        /// Constant, linear, quadratic attenuation
        attenuation: [f32; 3],
    },
    /// Spot light (like a flashlight)
    Spot {
        /// Light position
        position: Point3,
        /// Light direction
        direction: Vec3,
        /// Cone half angle in radians
        spread_angle: f32,
    },
}

/// Light source
#[derive(Debug, Clone, PartialEq)]
pub struct Light {
    /// Identity
    pub id: LightId,
    /// Light type
    pub kind: LightKind,
    /// Light color
    pub color: Vec3,
    /// Whether the light is switched on
    pub enabled: bool,
}

impl Light {
    /// Create a directional light
    pub fn directional(id: u64, direction: Vec3, color: Vec3) -> Self {
        Self {
            id: LightId(id),
            kind: LightKind::Directional {
                direction: direction.normalize(),
            },
            color,
            enabled: true,
        }
    }

    /// Create an ambient light
    pub fn ambient(id: u64, color: Vec3) -> Self {
        Self {
            id: LightId(id),
            kind: LightKind::Ambient,
            color,
            enabled: true,
        }
    }
}

/// Fog falloff
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FogKind {
    /// Linear between front and back distances
    Linear {
        /// Start distance
        front: f32,
        /// Full-fog distance
        back: f32,
    },
    /// Exponential with the given density
    Exponential {
        /// Density
        density: f32,
    },
}

/// Fog
#[derive(Debug, Clone, PartialEq)]
pub struct Fog {
    /// Identity
    pub id: FogId,
    /// Fog colour
    pub color: Vec3,
    /// Falloff
    pub kind: FogKind,
}

/// Model clip planes
#[derive(Debug, Clone, PartialEq)]
pub struct ModelClip {
    /// Identity
    pub id: ModelClipId,
    /// Up to six clip planes
    pub planes: Vec<Plane>,
    /// One bit per enabled plane
    pub enables: u8,
}

/// Background: clear colour plus optional background geometry
#[derive(Debug, Clone)]
pub struct Background {
    /// Clear colour
    pub color: [f32; 4],
    /// Geometry drawn behind the scene
    pub geometry: Vec<Arc<DrawAtom>>,
}

impl Default for Background {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.0, 1.0],
            geometry: Vec::new(),
        }
    }
}

/// The lights/fog/clip/alternate appearance influencing one atom
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedEnvironment {
    /// Influencing lights
    pub lights: Vec<LightId>,
    /// Influencing fog
    pub fog: Option<FogId>,
    /// Influencing model clip
    pub model_clip: Option<ModelClipId>,
    /// Appearance override
    pub alternate_appearance: Option<Arc<Appearance>>,
}

impl ResolvedEnvironment {
    /// Environment with the given lights and nothing else
    pub fn with_lights(lights: impl IntoIterator<Item = LightId>) -> Self {
        Self {
            lights: lights.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Sort and dedup the light set, keeping at most `max_lights` of the
    /// resolver's highest-priority (earliest) lights
    pub fn normalized(mut self, max_lights: usize) -> Self {
        let mut seen = Vec::with_capacity(self.lights.len());
        for light in self.lights {
            if !seen.contains(&light) {
                seen.push(light);
            }
        }
        if seen.len() > max_lights {
            log::warn!(
                "{} influencing lights exceed the device capacity of {max_lights}; truncating",
                seen.len()
            );
            seen.truncate(max_lights);
        }
        seen.sort_unstable();
        self.lights = seen;
        self
    }

    /// Whether the light/fog/clip part matches (alternate appearance ignored)
    pub fn same_environment(&self, other: &Self) -> bool {
        self.lights == other.lights && self.fog == other.fog && self.model_clip == other.model_clip
    }
}

/// Resolves the influencing environment for an atom in a view
pub trait EnvironmentResolver: Send + Sync {
    /// Resolve lights, fog, model clip and alternate appearance
    fn resolve(&self, atom: &DrawAtom, view: &ViewSettings) -> ResolvedEnvironment;
}

/// Resolver backed by a global environment plus per-atom overrides
#[derive(Debug, Default)]
pub struct ScopedEnvironment {
    global: RwLock<ResolvedEnvironment>,
    per_atom: RwLock<HashMap<DrawAtomId, ResolvedEnvironment>>,
}

impl ScopedEnvironment {
    /// Empty environment: no lights, fog or clip
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the environment applied to atoms without an override
    pub fn set_global(&self, environment: ResolvedEnvironment) {
        *self.global.write() = environment;
    }

    /// Override the environment of one atom
    pub fn set_for_atom(&self, atom: DrawAtomId, environment: ResolvedEnvironment) {
        self.per_atom.write().insert(atom, environment);
    }

    /// Drop the override of one atom
    pub fn clear_atom(&self, atom: DrawAtomId) {
        self.per_atom.write().remove(&atom);
    }
}

impl EnvironmentResolver for ScopedEnvironment {
    fn resolve(&self, atom: &DrawAtom, _view: &ViewSettings) -> ResolvedEnvironment {
        if let Some(env) = self.per_atom.read().get(&atom.id) {
            return env.clone();
        }
        self.global.read().clone()
    }
}
