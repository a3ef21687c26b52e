//! Error types for the render bin

use crate::config::ConfigError;
use crate::render::canvas::CanvasId;
use crate::render::pipeline::DeviceError;

/// Result alias for render-bin operations
pub type RenderBinResult<T> = Result<T, RenderBinError>;

/// Errors surfaced by the render bin
#[derive(thiserror::Error, Debug)]
pub enum RenderBinError {
    /// The canvas was never attached or was already detached
    ///
    /// Caller misuse; nothing was mutated.
    #[error("Canvas {0:?} is not attached to this render bin")]
    UnknownCanvas(CanvasId),

    /// A fatal device error disabled the canvas
    ///
    /// Other canvases keep rendering from the same bin hierarchy.
    #[error("Canvas {0:?} is disabled after a fatal device error")]
    CanvasDisabled(CanvasId),

    /// Device call failed while rendering
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Off-screen rendering was requested before the off-screen size was set
    #[error("Canvas {0:?} has no off-screen buffer size configured")]
    OffscreenNotConfigured(CanvasId),

    /// An off-screen render is already in flight; retry later
    #[error("Canvas {0:?} already has an off-screen render in progress")]
    OffscreenBusy(CanvasId),

    /// Every context bit is in use
    #[error("No free device context slot (limit {0})")]
    ContextLimitExceeded(usize),

    /// Detach attempted before the render thread released the context
    #[error("Teardown of canvas {0:?} has not been acknowledged by its render thread")]
    TeardownPending(CanvasId),

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
