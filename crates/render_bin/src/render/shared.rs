//! Shared handle for one update thread and many render threads
//!
//! ```text
//! update thread                         render threads (one per canvas)
//! ─────────────                         ──────────────────────────────
//! ready = false
//! write lock ─ process_messages
//!            ─ update_object
//! frame += 1, ready = true  ──────────► read lock ─ render_frame
//! ```
//!
//! Render threads never see a half-applied update: they only walk the bin
//! while the handshake reports it ready, and the write lock excludes them
//! while an update is applied.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::render::canvas::CanvasId;
use crate::render::error::RenderBinResult;
use crate::render::pipeline::{RenderContext, RenderStats};
use crate::render::render_bin::RenderBin;
use crate::render::update::UpdateStats;

/// `render_bin_ready` flag plus the count of published updates
#[derive(Debug, Default)]
pub struct FrameHandshake {
    ready: AtomicBool,
    frame: AtomicU64,
}

impl FrameHandshake {
    /// Not ready, no frame published
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether render threads may walk the bin
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Last published update
    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    fn begin_update(&self) {
        self.ready.store(false, Ordering::Release);
    }

    fn publish(&self) -> u64 {
        let frame = self.frame.fetch_add(1, Ordering::AcqRel) + 1;
        self.ready.store(true, Ordering::Release);
        frame
    }

    /// Yield until an update newer than `after` is published
    pub fn wait_for_frame(&self, after: u64) -> u64 {
        loop {
            let frame = self.frame();
            if frame > after && self.is_ready() {
                return frame;
            }
            thread::yield_now();
        }
    }
}

/// A render bin shared between its update thread and render threads
#[derive(Debug)]
pub struct SharedRenderBin {
    bin: RwLock<RenderBin>,
    handshake: FrameHandshake,
}

impl SharedRenderBin {
    /// Wrap `bin`; nothing is rendered until the first update is published
    pub fn new(bin: RenderBin) -> Self {
        Self {
            bin: RwLock::new(bin),
            handshake: FrameHandshake::new(),
        }
    }

    /// The ready flag and frame counter
    pub fn handshake(&self) -> &FrameHandshake {
        &self.handshake
    }

    /// Run one update cycle and publish it to the render threads
    pub fn update(&self, reference_time: u64) -> UpdateStats {
        self.handshake.begin_update();
        let stats = {
            let mut bin = self.bin.write();
            bin.process_messages(reference_time);
            bin.update_object()
        };
        let frame = self.handshake.publish();
        log::trace!("Published update {frame}");
        stats
    }

    /// Exclusive access outside the update cycle (insert, remove, canvas attach)
    pub fn write(&self) -> RwLockWriteGuard<'_, RenderBin> {
        self.bin.write()
    }

    /// Shared access for diagnostics
    pub fn read(&self) -> RwLockReadGuard<'_, RenderBin> {
        self.bin.read()
    }

    /// Render one frame if an update has been published
    ///
    /// Returns `Ok(None)` while the bin is not ready.
    ///
    /// # Errors
    ///
    /// See [`RenderBin::render_frame`].
    pub fn render_frame(&self, context: &mut RenderContext<'_>) -> RenderBinResult<Option<RenderStats>> {
        if !self.handshake.is_ready() {
            return Ok(None);
        }
        self.bin.read().render_frame(context).map(Some)
    }

    /// Tear a canvas down: request, wait for its render thread, detach
    ///
    /// The render thread for `id` must keep calling
    /// [`Self::render_frame`] until it acknowledges.
    ///
    /// # Errors
    ///
    /// [`RenderBinError::UnknownCanvas`](crate::render::error::RenderBinError::UnknownCanvas)
    /// when `id` is not attached.
    pub fn detach_canvas(&self, id: CanvasId) -> RenderBinResult<()> {
        let canvas = self.bin.read().request_teardown(id)?;
        canvas.wait_teardown();
        self.bin.write().detach_canvas(id)
    }

    /// Unwrap the bin
    pub fn into_inner(self) -> RenderBin {
        self.bin.into_inner()
    }
}
