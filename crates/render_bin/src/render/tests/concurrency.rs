//! One update thread and render threads sharing a bin

use super::fixtures::*;
use crate::core::config::RenderBinConfig;
use crate::render::canvas::{CanvasDescriptor, CanvasId};
use crate::render::messages::{MessageBus, MutationMessage};
use crate::render::pipeline::RenderContext;
use crate::render::render_bin::{Collaborators, RenderBin};
use crate::render::shared::SharedRenderBin;
use crate::scene::{AllRegistered, ScopedEnvironment};
use std::sync::Arc;
use std::thread;

fn shared_bin(bus: &MessageBus) -> SharedRenderBin {
    crate::foundation::logging::init_for_tests();
    let collaborators = Collaborators {
        visibility: Arc::new(AllRegistered),
        environment: Arc::new(ScopedEnvironment::new()),
    };
    let bin = RenderBin::new(RenderBinConfig::default(), collaborators, bus.subscribe()).expect("valid config");
    SharedRenderBin::new(bin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nothing_renders_before_the_first_update() {
        let bus = MessageBus::new();
        let shared = shared_bin(&bus);
        let canvas = shared.write().attach_canvas(&CanvasDescriptor::new(1)).expect("attach");
        assert!(!shared.handshake().is_ready());

        let mut device = RecordingDevice::default();
        let mut context = RenderContext::new(&canvas, &mut device);
        assert!(shared.render_frame(&mut context).expect("render").is_none());

        shared.update(1);
        assert!(shared.handshake().is_ready());
        assert_eq!(shared.handshake().frame(), 1);
        assert!(shared.render_frame(&mut context).expect("render").is_some());
    }

    #[test]
    fn test_waiting_render_thread_wakes_on_publish() {
        let bus = MessageBus::new();
        let shared = shared_bin(&bus);

        thread::scope(|scope| {
            let waiter = scope.spawn(|| shared.handshake().wait_for_frame(0));
            bus.publish(1, MutationMessage::InsertNodes(vec![Arc::new(solid(1))]));
            let stats = shared.update(1);
            assert_eq!(stats.inserted, 1);
            assert_eq!(waiter.join().expect("waiter"), 1);
        });
    }

    #[test]
    fn test_render_thread_runs_against_updates() {
        let bus = MessageBus::new();
        let shared = shared_bin(&bus);
        let canvas = shared.write().attach_canvas(&CanvasDescriptor::new(1)).expect("attach");

        thread::scope(|scope| {
            let renderer = scope.spawn(|| {
                let mut device = RecordingDevice::default();
                let mut context = RenderContext::new(&canvas, &mut device);
                let (mut seen, mut frames) = (0, 0);
                while !canvas.teardown_acknowledged() {
                    let frame = shared.handshake().frame();
                    if frame > seen || canvas.teardown_requested() {
                        if shared.render_frame(&mut context).expect("render").is_some() {
                            frames += 1;
                            assert_eq!(shared.read().check_invariants(), Ok(()));
                        }
                        seen = frame;
                    } else {
                        thread::yield_now();
                    }
                }
                frames
            });

            for time in 1..=24 {
                bus.publish(time, MutationMessage::InsertNodes(vec![Arc::new(solid(time))]));
                if time % 3 == 0 {
                    bus.publish(time, MutationMessage::RemoveNodes(ids(&[time - 1])));
                }
                shared.update(time);
            }
            shared.detach_canvas(CanvasId(1)).expect("detach");
            let frames = renderer.join().expect("render thread");
            assert!(frames >= 1);
        });

        let bin = shared.into_inner();
        assert!(bin.canvas(CanvasId(1)).is_none());
        assert_eq!(bin.registered_count(), 16);
        assert_eq!(bin.check_invariants(), Ok(()));
    }

    #[test]
    fn test_render_threads_share_one_published_frame() {
        let bus = MessageBus::new();
        let shared = shared_bin(&bus);
        let first = shared.write().attach_canvas(&CanvasDescriptor::new(1)).expect("attach");
        let second = shared.write().attach_canvas(&CanvasDescriptor::new(2)).expect("attach");
        bus.publish(1, MutationMessage::InsertNodes(vec![Arc::new(solid(1)), Arc::new(solid(2))]));
        shared.update(1);

        let stats = thread::scope(|scope| {
            let handles: Vec<_> = [&first, &second]
                .into_iter()
                .map(|canvas| {
                    let shared = &shared;
                    scope.spawn(move || {
                        let mut device = RecordingDevice::default();
                        let mut context = RenderContext::new(canvas, &mut device);
                        shared.render_frame(&mut context).expect("render").expect("ready")
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("render thread"))
                .collect::<Vec<_>>()
        });
        for frame in stats {
            assert_eq!(frame.list_calls, 1);
            assert_eq!(frame.resources_created, 1);
        }
    }
}
