//! Mutation messages and their fan-out to views
//!
//! ```text
//! scene graph ──publish──► MessageBus ──Arc<MessageEnvelope>──► MessageQueue (one per view)
//!                                                                  │
//!                                          drain_until(reference_time) at process_messages
//! ```
//!
//! Envelopes are shared by every subscribed view; the payload is freed when
//! the last view drops its handle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::foundation::math::Mat4;
use crate::render::canvas::CanvasId;
use crate::scene::{
    Appearance, AppearanceComponents, Background, Component, DrawAtom, DrawAtomId, Fog, Light, ModelClip,
    OrderedGroupId, ShaderProgram, TextureId, TransformGroupId, ViewSettings,
};

/// A scene-graph change
#[derive(Debug, Clone)]
pub enum MutationMessage {
    /// Shapes were added; their draw atoms become registered
    InsertNodes(Vec<Arc<DrawAtom>>),
    /// Shapes were removed
    RemoveNodes(Vec<DrawAtomId>),
    /// New local-to-world transforms
    TransformChanged(Vec<(TransformGroupId, Mat4)>),
    /// Light contents changed; `scope_changed` when its influence changed
    LightChanged {
        /// New light state
        light: Light,
        /// Bounds or scope changed
        scope_changed: bool,
    },
    /// Fog contents changed
    FogChanged {
        /// New fog state
        fog: Fog,
        /// Bounds or scope changed
        scope_changed: bool,
    },
    /// Model clip contents changed
    ModelClipChanged {
        /// New clip state
        clip: ModelClip,
        /// Bounds or scope changed
        scope_changed: bool,
    },
    /// Alternate appearance scopes changed
    AlternateAppearanceChanged,
    /// Background colour or geometry changed
    BackgroundChanged(Background),
    /// Appearance contents changed for the listed atoms
    AppearanceChanged {
        /// New appearance
        appearance: Arc<Appearance>,
        /// Components that changed
        components: AppearanceComponents,
        /// Affected atoms
        atoms: Vec<DrawAtomId>,
    },
    /// Geometry changed; carries the replacement draw atoms
    GeometryChanged(Vec<Arc<DrawAtom>>),
    /// Texture contents changed
    TextureChanged(TextureId),
    /// Shader program or its attributes changed for the listed atoms
    ShaderChanged {
        /// New shader component
        shader: Option<Component<ShaderProgram>>,
        /// Affected atoms
        atoms: Vec<DrawAtomId>,
    },
    /// An ordered group appeared
    OrderedGroupInserted {
        /// The group
        group: OrderedGroupId,
        /// Custom child draw order
        child_order: Option<Vec<usize>>,
    },
    /// An ordered group went away
    OrderedGroupRemoved(OrderedGroupId),
    /// An ordered group's child order changed
    OrderedGroupTableChanged {
        /// The group
        group: OrderedGroupId,
        /// Custom child draw order; `None` restores child order
        child_order: Option<Vec<usize>>,
    },
    /// View parameters changed
    UpdateView(ViewSettings),
    /// Switch nodes changed which atoms are on
    SwitchChanged {
        /// Atoms switched on
        on: Vec<DrawAtomId>,
        /// Atoms switched off
        off: Vec<DrawAtomId>,
    },
    /// Render one frame into a canvas's off-screen buffer
    RenderOffscreen(CanvasId),
}

impl MutationMessage {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::InsertNodes(_) => "InsertNodes",
            Self::RemoveNodes(_) => "RemoveNodes",
            Self::TransformChanged(_) => "TransformChanged",
            Self::LightChanged { .. } => "LightChanged",
            Self::FogChanged { .. } => "FogChanged",
            Self::ModelClipChanged { .. } => "ModelClipChanged",
            Self::AlternateAppearanceChanged => "AlternateAppearanceChanged",
            Self::BackgroundChanged(_) => "BackgroundChanged",
            Self::AppearanceChanged { .. } => "AppearanceChanged",
            Self::GeometryChanged(_) => "GeometryChanged",
            Self::TextureChanged(_) => "TextureChanged",
            Self::ShaderChanged { .. } => "ShaderChanged",
            Self::OrderedGroupInserted { .. } => "OrderedGroupInserted",
            Self::OrderedGroupRemoved(_) => "OrderedGroupRemoved",
            Self::OrderedGroupTableChanged { .. } => "OrderedGroupTableChanged",
            Self::UpdateView(_) => "UpdateView",
            Self::SwitchChanged { .. } => "SwitchChanged",
            Self::RenderOffscreen(_) => "RenderOffscreen",
        }
    }
}

/// A message with its arrival order and scene time
#[derive(Debug)]
pub struct MessageEnvelope {
    /// Arrival order across the bus
    pub seq: u64,
    /// Scene time the change belongs to
    pub time: u64,
    /// Payload
    pub message: MutationMessage,
}

/// Fans messages out to every subscribed view
#[derive(Debug, Default)]
pub struct MessageBus {
    subscribers: Mutex<Vec<Sender<Arc<MessageEnvelope>>>>,
    next_seq: AtomicU64,
}

impl MessageBus {
    /// Bus without subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue for a new view; it sees every message published from now on
    pub fn subscribe(&self) -> MessageQueue {
        let (sender, receiver) = unbounded();
        self.subscribers.lock().push(sender);
        MessageQueue::from_receiver(receiver)
    }

    /// Deliver `message` to every live subscriber; returns its sequence number
    pub fn publish(&self, time: u64, message: MutationMessage) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let envelope = Arc::new(MessageEnvelope { seq, time, message });
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sender| sender.send(Arc::clone(&envelope)).is_ok());
        log::trace!(
            "Published {} #{seq} to {} views",
            envelope.message.name(),
            subscribers.len()
        );
        seq
    }

    /// Views still subscribed
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// One view's incoming messages
#[derive(Debug)]
pub struct MessageQueue {
    receiver: Receiver<Arc<MessageEnvelope>>,
    backlog: VecDeque<Arc<MessageEnvelope>>,
}

impl MessageQueue {
    fn from_receiver(receiver: Receiver<Arc<MessageEnvelope>>) -> Self {
        Self {
            receiver,
            backlog: VecDeque::new(),
        }
    }

    /// Queue fed by a private sender, for a view that is not on a bus
    pub fn standalone() -> (Sender<Arc<MessageEnvelope>>, Self) {
        let (sender, receiver) = unbounded();
        (sender, Self::from_receiver(receiver))
    }

    fn pull(&mut self) {
        self.backlog.extend(self.receiver.try_iter());
    }

    /// Messages up to `reference_time`, in arrival order
    ///
    /// Draining stops at the first newer message so arrival order holds;
    /// it stays in the backlog for a later frame.
    pub fn drain_until(&mut self, reference_time: u64) -> Vec<Arc<MessageEnvelope>> {
        self.pull();
        let ready = self
            .backlog
            .iter()
            .position(|m| m.time > reference_time)
            .unwrap_or(self.backlog.len());
        self.backlog.drain(..ready).collect()
    }

    /// Every queued message regardless of time
    pub fn drain_all(&mut self) -> Vec<Arc<MessageEnvelope>> {
        self.pull();
        self.backlog.drain(..).collect()
    }

    /// Messages not yet drained
    pub fn pending(&self) -> usize {
        self.backlog.len() + self.receiver.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_fans_out_shared_envelopes() {
        let bus = MessageBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.publish(1, MutationMessage::TextureChanged(TextureId(3)));

        let a = first.drain_until(1);
        let b = second.drain_until(1);
        assert_eq!(a.len(), 1);
        assert!(Arc::ptr_eq(&a[0], &b[0]));
        assert_eq!(Arc::strong_count(&a[0]), 2);
        drop(b);
        assert_eq!(Arc::strong_count(&a[0]), 1);
    }

    #[test]
    fn test_newer_messages_wait_in_backlog() {
        let bus = MessageBus::new();
        let mut queue = bus.subscribe();
        bus.publish(1, MutationMessage::AlternateAppearanceChanged);
        bus.publish(5, MutationMessage::TextureChanged(TextureId(1)));
        bus.publish(2, MutationMessage::AlternateAppearanceChanged);

        let now = queue.drain_until(3);
        assert_eq!(now.len(), 1);
        assert_eq!(queue.pending(), 2);
        let later = queue.drain_until(5);
        assert_eq!(later.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_dropped_views_unsubscribe() {
        let bus = MessageBus::new();
        let queue = bus.subscribe();
        let _kept = bus.subscribe();
        drop(queue);
        bus.publish(0, MutationMessage::AlternateAppearanceChanged);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
