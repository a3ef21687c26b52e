//! # Render Bin Engine
//!
//! Retained-mode state sorting for one view of a scene graph.
//!
//! ## Architecture
//!
//! - **Bins**: equivalence classes of device state, nested from lights down to
//!   material so a render pass changes state only at bin boundaries
//! - **Atoms**: one render atom per visible draw atom, linked into a molecule
//! - **Transparency**: depth-sorted records for blended geometry, resorted
//!   incrementally when few depths move
//! - **Resources**: per-context creation masks for draw lists and textures,
//!   released only after every sharing context has freed them
//! - **Messages**: scene-graph changes staged by `process_messages` and applied
//!   together by `update_object`
//! - **Canvases**: per-context dirty flags, off-screen requests and teardown

pub mod atom;
pub mod bins;
pub mod canvas;
pub mod compaction;
pub mod error;
pub mod flags;
pub mod messages;
pub mod pipeline;
pub mod resources;
pub mod transparency;

mod render_bin;
mod render_pass;
mod shared;
mod update;

#[cfg(test)]
mod tests;

pub use atom::{AtomState, RenderAtom};
pub use bins::{BinChain, BinCounts, DomainId};
pub use canvas::{CanvasDescriptor, CanvasId, CanvasState};
pub use error::{RenderBinError, RenderBinResult};
pub use flags::CanvasDirty;
pub use messages::{MessageBus, MessageEnvelope, MessageQueue, MutationMessage};
pub use pipeline::{DeviceError, DevicePipeline, DeviceResult, RenderContext, RenderStats, StateCache};
pub use render_bin::{Collaborators, FrameState, RenderBin};
pub use resources::{DisplayListId, ListKind, ResourceCounts};
pub use shared::{FrameHandshake, SharedRenderBin};
pub use transparency::{ResortKind, SortTarget};
pub use update::UpdateStats;
