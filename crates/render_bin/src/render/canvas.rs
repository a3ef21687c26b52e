//! Per-canvas state shared between the update thread and a render thread
//!
//! A canvas owns one bit of every resource creation mask. Canvases in the
//! same share group render through one device context and therefore share
//! the bit. Dirty flags are double buffered: the update thread only ever
//! writes slot 1 and publishes it into slot 0 while it holds the bin
//! exclusively; the render thread only consumes slot 0.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::render::error::{RenderBinError, RenderBinResult};
use crate::render::flags::CanvasDirty;
use crate::render::resources::DeviceResource;

const RENDER_SLOT: usize = 0;
const UPDATE_SLOT: usize = 1;

/// Identity of a canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanvasId(pub u32);

/// Attach parameters for a canvas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanvasDescriptor {
    /// Identity
    pub id: CanvasId,
    /// Canvases with the same group share one device context
    pub share_group: Option<u32>,
    /// Off-screen buffer size, when rendering off-screen is allowed
    pub offscreen_size: Option<(u32, u32)>,
}

impl CanvasDescriptor {
    /// An on-screen canvas with its own context
    pub fn new(id: u32) -> Self {
        Self {
            id: CanvasId(id),
            share_group: None,
            offscreen_size: None,
        }
    }

    /// Share a device context with other canvases of `group`
    pub fn shared(mut self, group: u32) -> Self {
        self.share_group = Some(group);
        self
    }

    /// Allow off-screen rendering at the given size
    pub fn with_offscreen_size(mut self, width: u32, height: u32) -> Self {
        self.offscreen_size = Some((width, height));
        self
    }
}

/// Off-screen request bookkeeping
#[derive(Debug, Default)]
struct Offscreen {
    size: Option<(u32, u32)>,
    in_progress: bool,
}

/// State of one attached canvas
#[derive(Debug)]
pub struct CanvasState {
    id: CanvasId,
    share_group: Mutex<Option<u32>>,
    context_bit: AtomicU32,
    context_stamp: AtomicU64,
    dirty: [AtomicU32; 2],
    fatal: AtomicBool,
    offscreen: Mutex<Offscreen>,
    offscreen_done: AtomicBool,
    pending_frees: Mutex<Vec<Arc<DeviceResource>>>,
    freed: Mutex<Vec<Arc<DeviceResource>>>,
    teardown_requested: AtomicBool,
    teardown_acked: AtomicBool,
}

impl CanvasState {
    pub(crate) fn new(descriptor: &CanvasDescriptor, context_bit: u32) -> Self {
        let all = CanvasDirty::all().bits();
        Self {
            id: descriptor.id,
            share_group: Mutex::new(descriptor.share_group),
            context_bit: AtomicU32::new(context_bit),
            context_stamp: AtomicU64::new(1),
            dirty: [AtomicU32::new(all), AtomicU32::new(0)],
            fatal: AtomicBool::new(false),
            offscreen: Mutex::new(Offscreen {
                size: descriptor.offscreen_size,
                in_progress: false,
            }),
            offscreen_done: AtomicBool::new(false),
            pending_frees: Mutex::new(Vec::new()),
            freed: Mutex::new(Vec::new()),
            teardown_requested: AtomicBool::new(false),
            teardown_acked: AtomicBool::new(false),
        }
    }

    /// Canvas identity
    pub fn id(&self) -> CanvasId {
        self.id
    }

    /// Share group, if any
    pub fn share_group(&self) -> Option<u32> {
        *self.share_group.lock()
    }

    /// Bit index of this canvas's context in resource creation masks
    pub fn context_bit(&self) -> u32 {
        self.context_bit.load(Ordering::Acquire)
    }

    /// Current context generation; bumped whenever the context is recreated
    pub fn context_stamp(&self) -> u64 {
        self.context_stamp.load(Ordering::Acquire)
    }

    /// The device context was lost: every resource must be recreated
    pub fn context_lost(&self) {
        let stamp = self.context_stamp.fetch_add(1, Ordering::AcqRel) + 1;
        self.dirty[RENDER_SLOT].fetch_or(CanvasDirty::all().bits(), Ordering::AcqRel);
        log::info!("Canvas {:?} lost its context; now at context stamp {stamp}", self.id);
    }

    /// Render through another device context from now on
    ///
    /// Canvases on one context bit must agree on `stamp`. Only called while
    /// the bin is held exclusively.
    pub(crate) fn rebind_context(&self, bit: u32, group: Option<u32>, stamp: u64) {
        *self.share_group.lock() = group;
        self.context_bit.store(bit, Ordering::Release);
        self.context_stamp.store(stamp, Ordering::Release);
        self.dirty[RENDER_SLOT].fetch_or(CanvasDirty::all().bits(), Ordering::AcqRel);
    }

    // Dirty flags

    /// Record state the render thread must re-issue (update thread side)
    pub fn mark_dirty(&self, flags: CanvasDirty) {
        self.dirty[UPDATE_SLOT].fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Move update-side flags into the render slot
    ///
    /// Only called while the bin is held exclusively, so no render thread is
    /// reading slot 0.
    pub(crate) fn publish_dirty(&self) {
        let pending = self.dirty[UPDATE_SLOT].swap(0, Ordering::AcqRel);
        if pending != 0 {
            self.dirty[RENDER_SLOT].fetch_or(pending, Ordering::AcqRel);
        }
    }

    /// Take the flags published for the render thread
    pub fn take_render_dirty(&self) -> CanvasDirty {
        CanvasDirty::from_bits_truncate(self.dirty[RENDER_SLOT].swap(0, Ordering::AcqRel))
    }

    /// Flags waiting on the update side, not yet published
    pub fn pending_dirty(&self) -> CanvasDirty {
        CanvasDirty::from_bits_truncate(self.dirty[UPDATE_SLOT].load(Ordering::Acquire))
    }

    // Fatal errors

    /// Stop rendering to this canvas
    pub fn mark_fatal(&self) {
        if !self.fatal.swap(true, Ordering::AcqRel) {
            log::error!("Canvas {:?} disabled after a fatal device error", self.id);
        }
    }

    /// Whether a fatal device error disabled this canvas
    pub fn is_disabled(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    // Off-screen rendering

    /// Set (or clear) the off-screen buffer size
    pub fn set_offscreen_size(&self, size: Option<(u32, u32)>) {
        self.offscreen.lock().size = size;
    }

    /// Off-screen buffer size
    pub fn offscreen_size(&self) -> Option<(u32, u32)> {
        self.offscreen.lock().size
    }

    /// Start an off-screen render
    ///
    /// # Errors
    ///
    /// [`RenderBinError::OffscreenNotConfigured`] without a buffer size,
    /// [`RenderBinError::OffscreenBusy`] while another request is in flight.
    pub fn request_offscreen(&self) -> RenderBinResult<()> {
        let mut offscreen = self.offscreen.lock();
        if offscreen.size.is_none() {
            return Err(RenderBinError::OffscreenNotConfigured(self.id));
        }
        if offscreen.in_progress {
            return Err(RenderBinError::OffscreenBusy(self.id));
        }
        offscreen.in_progress = true;
        self.offscreen_done.store(false, Ordering::Release);
        Ok(())
    }

    /// Whether an off-screen render is in flight
    pub fn offscreen_in_progress(&self) -> bool {
        self.offscreen.lock().in_progress
    }

    /// Render thread finished the off-screen frame
    pub(crate) fn complete_offscreen(&self) {
        let mut offscreen = self.offscreen.lock();
        if offscreen.in_progress {
            offscreen.in_progress = false;
            self.offscreen_done.store(true, Ordering::Release);
        }
    }

    /// Yield until the in-flight off-screen render completes
    pub fn wait_offscreen(&self) {
        while self.offscreen_in_progress() {
            std::thread::yield_now();
        }
    }

    /// Whether the last off-screen request completed
    pub fn offscreen_completed(&self) -> bool {
        self.offscreen_done.load(Ordering::Acquire)
    }

    // Resource frees

    /// Queue a resource to be freed on this canvas's context
    pub(crate) fn queue_free(&self, resource: Arc<DeviceResource>) {
        self.pending_frees.lock().push(resource);
    }

    /// Resources the render thread must free on the device
    pub(crate) fn take_pending_frees(&self) -> Vec<Arc<DeviceResource>> {
        std::mem::take(&mut *self.pending_frees.lock())
    }

    /// Number of frees not yet performed by the render thread
    pub fn pending_free_count(&self) -> usize {
        self.pending_frees.lock().len()
    }

    /// Render thread reports resources it freed on the device
    pub(crate) fn acknowledge_frees(&self, resources: impl IntoIterator<Item = Arc<DeviceResource>>) {
        self.freed.lock().extend(resources);
    }

    /// Frees acknowledged by the render thread, for reconciliation
    pub(crate) fn take_freed(&self) -> Vec<Arc<DeviceResource>> {
        std::mem::take(&mut *self.freed.lock())
    }

    // Teardown

    /// Ask the render thread to release this canvas's resources
    pub(crate) fn request_teardown(&self) {
        self.teardown_acked.store(false, Ordering::Release);
        self.teardown_requested.store(true, Ordering::Release);
    }

    /// Whether teardown was requested
    pub fn teardown_requested(&self) -> bool {
        self.teardown_requested.load(Ordering::Acquire)
    }

    /// Render thread released everything for this canvas
    pub(crate) fn acknowledge_teardown(&self) {
        self.teardown_acked.store(true, Ordering::Release);
    }

    /// Whether the render thread acknowledged teardown
    pub fn teardown_acknowledged(&self) -> bool {
        self.teardown_acked.load(Ordering::Acquire)
    }

    /// Yield until the render thread acknowledges teardown
    pub fn wait_teardown(&self) {
        while !self.teardown_acknowledged() {
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_flags_are_double_buffered() {
        let canvas = CanvasState::new(&CanvasDescriptor::new(1), 0);
        assert_eq!(canvas.take_render_dirty(), CanvasDirty::all());

        canvas.mark_dirty(CanvasDirty::LIGHTS);
        assert!(canvas.take_render_dirty().is_empty());
        assert_eq!(canvas.pending_dirty(), CanvasDirty::LIGHTS);

        canvas.publish_dirty();
        assert!(canvas.pending_dirty().is_empty());
        assert_eq!(canvas.take_render_dirty(), CanvasDirty::LIGHTS);
    }

    #[test]
    fn test_offscreen_request_errors() {
        let canvas = CanvasState::new(&CanvasDescriptor::new(3), 0);
        assert!(matches!(
            canvas.request_offscreen(),
            Err(RenderBinError::OffscreenNotConfigured(CanvasId(3)))
        ));

        canvas.set_offscreen_size(Some((64, 64)));
        canvas.request_offscreen().unwrap();
        assert!(matches!(canvas.request_offscreen(), Err(RenderBinError::OffscreenBusy(_))));

        canvas.complete_offscreen();
        canvas.wait_offscreen();
        assert!(canvas.offscreen_completed());
        assert!(canvas.request_offscreen().is_ok());
    }

    #[test]
    fn test_context_loss_bumps_stamp() {
        let canvas = CanvasState::new(&CanvasDescriptor::new(1), 2);
        let _ = canvas.take_render_dirty();
        let before = canvas.context_stamp();
        canvas.context_lost();
        assert_eq!(canvas.context_stamp(), before + 1);
        assert_eq!(canvas.take_render_dirty(), CanvasDirty::all());
    }
}
