//! Scene-side collaborator data
//!
//! Everything in here is produced by the scene graph and only read by the
//! render bin: draw atoms and their geometry, appearance components,
//! environment objects, view settings, and the two query traits the bin
//! calls back into ([`VisibilityQuery`] and [`EnvironmentResolver`]).

pub mod appearance;
pub mod draw_atom;
pub mod environment;
pub mod view;

pub use appearance::{
    equivalent, equivalent_units, same_sole_object, Appearance, AppearanceComponents, BlendFactor, CompareFunction, Component, ComponentId, CullFace, Material,
    PolygonAttributes, PolygonMode, RenderingAttributes, ShaderAttribute, ShaderProgram, TextureId, TextureMode,
    TextureUnitState, TransparencyAttributes, TransparencyMode,
};
pub use draw_atom::{
    DrawAtom, DrawAtomId, Geometry, GeometryId, GeometryKind, OrderedGroupId, OrderedPath, ShapeId, TransformGroupId,
};
pub use environment::{
    Background, EnvironmentResolver, Fog, FogId, FogKind, Light, LightId, LightKind, ModelClip, ModelClipId,
    ResolvedEnvironment, ScopedEnvironment,
};
pub use view::{
    AllRegistered, CandidateSet, Candidates, DepthSortKey, TransparencyComparator, ViewSettings, VisibilityQuery,
    VisibilityResult,
};
