//! # Render Bin
//!
//! A retained-mode render bin: keeps the visible draw atoms of one view sorted
//! into a hierarchy of device-state equivalence classes, keeps blended
//! geometry depth sorted, and lets an update thread apply scene changes while
//! render threads draw the previous result.
//!
//! ## Features
//!
//! - **State Sorting**: lights, environment, attributes, shader, textures and
//!   material as nested bins
//! - **Transparency**: per-piece or per-molecule depth sorting with
//!   incremental resort
//! - **Multi-Context**: draw lists and textures tracked per device context
//! - **Two-Phase Updates**: `process_messages` stages, `update_object` applies
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use render_bin::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = MessageBus::new();
//!     let collaborators = Collaborators {
//!         visibility: Arc::new(AllRegistered::default()),
//!         environment: Arc::new(ScopedEnvironment::default()),
//!     };
//!     let mut bin = RenderBin::new(RenderBinConfig::default(), collaborators, bus.subscribe())?;
//!
//!     bus.publish(1, MutationMessage::InsertNodes(Vec::new()));
//!     bin.process_messages(1);
//!     let stats = bin.update_object();
//!     println!("{stats:?}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod core;
pub mod foundation;
pub mod render;
pub mod scene;

/// Common imports for render bin users
pub mod prelude {
    pub use crate::{
        config::{Config, ConfigError},
        core::config::{CompactionConfig, RenderBinConfig, SortOrder, TransparencyConfig, TransparencySortMode},
        foundation::math::{Bounds, Mat4, Point3, Vec3},
        render::{
            CanvasDescriptor, CanvasId, Collaborators, DeviceError, DevicePipeline, MessageBus, MutationMessage,
            RenderBin, RenderBinError, RenderBinResult, RenderContext, RenderStats, SharedRenderBin,
        },
        scene::{
            AllRegistered, Appearance, DrawAtom, EnvironmentResolver, Geometry, ScopedEnvironment, ViewSettings,
            VisibilityQuery,
        },
    };
}
