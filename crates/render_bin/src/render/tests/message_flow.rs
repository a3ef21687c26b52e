//! Scene-graph messages from the bus through staging to the bins

use super::fixtures::*;
use crate::core::config::RenderBinConfig;
use crate::foundation::math::{Frustum, Mat4, Point3, Vec3};
use crate::render::atom::AtomState;
use crate::render::canvas::CanvasDescriptor;
use crate::render::messages::MutationMessage;
use crate::render::render_bin::{Collaborators, RenderBin};
use crate::scene::{
    AllRegistered, Appearance, AppearanceComponents, Component, DrawAtom, DrawAtomId, ResolvedEnvironment,
    ScopedEnvironment, ShaderProgram, TextureId, TextureUnitState, ViewSettings,
};
use std::sync::Arc;

fn textured(texture: u64) -> Arc<Appearance> {
    Arc::new(
        Appearance::default().with_texture_unit(Component::shared(300, TextureUnitState::with_texture(TextureId(texture)))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_future_messages_wait_for_their_time() {
        let mut harness = Harness::new(RenderBinConfig::default());
        harness.bus.publish(5, MutationMessage::InsertNodes(vec![Arc::new(solid(1))]));

        assert_eq!(harness.bin.process_messages(3), 0);
        harness.bin.update_object();
        assert_eq!(harness.bin.registered_count(), 0);

        assert_eq!(harness.bin.process_messages(5), 1);
        let stats = harness.bin.update_object();
        assert_eq!(stats.inserted, 1);
        assert_eq!(harness.bin.atom_state(DrawAtomId(1)), Some(AtomState::InBin));
    }

    #[test]
    fn test_every_view_receives_each_change() {
        let mut harness = Harness::new(RenderBinConfig::default());
        let collaborators = Collaborators {
            visibility: Arc::new(AllRegistered),
            environment: Arc::new(ScopedEnvironment::new()),
        };
        let mut second = RenderBin::new(RenderBinConfig::default(), collaborators, harness.bus.subscribe())
            .expect("valid config");

        harness.insert([solid(1), solid(2)]);
        second.process_messages(harness.time);
        second.update_object();
        assert_eq!(harness.bin.tracked_count(), 2);
        assert_eq!(second.tracked_count(), 2);
        assert!(second.check_invariants().is_ok());
    }

    #[test]
    fn test_changes_in_one_batch_apply_in_order() {
        let mut harness = Harness::new(RenderBinConfig::default());
        let stats = harness.step([
            MutationMessage::InsertNodes(vec![Arc::new(solid(1))]),
            MutationMessage::RemoveNodes(ids(&[1])),
        ]);
        assert_eq!(stats.inserted, 0);
        assert_eq!(harness.bin.atom_state(DrawAtomId(1)), None);
        assert_eq!(harness.bin.tracked_count(), 0);
    }

    #[test]
    fn test_unknown_atoms_are_skipped() {
        let mut harness = Harness::new(RenderBinConfig::default());
        harness.insert([solid(1)]);

        let stats = harness.step([
            MutationMessage::RemoveNodes(ids(&[42])),
            MutationMessage::AppearanceChanged {
                appearance: painted(1.0, 1.0, 1.0),
                components: AppearanceComponents::MATERIAL,
                atoms: ids(&[43]),
            },
            MutationMessage::SwitchChanged {
                on: ids(&[44]),
                off: Vec::new(),
            },
        ]);
        assert_eq!(stats.removed, 0);
        assert_eq!(stats.inserted, 0);
        assert_eq!(harness.bin.atom_state(DrawAtomId(1)), Some(AtomState::InBin));
    }

    #[test]
    fn test_switch_off_and_back_on() {
        let mut harness = Harness::new(RenderBinConfig::default());
        harness.insert([solid(1), solid(2)]);

        let stats = harness.step([MutationMessage::SwitchChanged {
            on: Vec::new(),
            off: ids(&[1]),
        }]);
        assert_eq!(stats.removed, 1);
        assert_eq!(harness.bin.atom_state(DrawAtomId(1)), Some(AtomState::NotVisible));
        assert_eq!(harness.bin.tracked_count(), 2);

        let stats = harness.step([MutationMessage::SwitchChanged {
            on: ids(&[1]),
            off: Vec::new(),
        }]);
        assert_eq!(stats.inserted, 1);
        assert_eq!(harness.bin.atom_state(DrawAtomId(1)), Some(AtomState::InBin));
    }

    #[test]
    fn test_frustum_culls_atoms_outside_the_view() {
        let mut harness = Harness::new(RenderBinConfig::default());
        let far = DrawAtom::new(2, vec![piece(2, Point3::origin())])
            .with_transform(crate::scene::TransformGroupId(2), Mat4::new_translation(&Vec3::new(5.0, 0.0, 0.0)));
        harness.step([
            MutationMessage::UpdateView(ViewSettings::default().with_frustum(Frustum::from_matrix(&Mat4::identity()))),
            MutationMessage::InsertNodes(vec![Arc::new(DrawAtom::new(1, vec![piece(1, Point3::origin())])), Arc::new(far)]),
        ]);
        assert_eq!(harness.bin.atom_state(DrawAtomId(1)), Some(AtomState::InBin));
        assert_eq!(harness.bin.atom_state(DrawAtomId(2)), Some(AtomState::NotVisible));

        // An atom without geometry has no bounds and is never culled
        harness.insert([DrawAtom::new(3, Vec::new())]);
        assert_eq!(harness.bin.atom_state(DrawAtomId(3)), Some(AtomState::InBin));
    }

    #[test]
    fn test_geometry_change_rebins_and_recompiles() {
        let mut harness = Harness::new(RenderBinConfig::default());
        let canvas = harness.bin.attach_canvas(&CanvasDescriptor::new(1)).expect("attach");
        harness.insert([solid(1)]);
        let mut device = RecordingDevice::default();
        harness.render(&canvas, &mut device).expect("render");

        let replacement = DrawAtom::new(1, vec![piece(11, Point3::origin()), piece(12, Point3::new(1.0, 0.0, 0.0))]);
        let stats = harness.step([MutationMessage::GeometryChanged(vec![Arc::new(replacement)])]);
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.inserted, 1);

        device.clear_calls();
        harness.render(&canvas, &mut device).expect("render");
        assert_eq!(device.count(|c| matches!(c, DeviceCall::CreateDrawList(_, 2))), 1);
    }

    #[test]
    fn test_texture_change_recreates_the_texture() {
        let mut harness = Harness::new(RenderBinConfig::default());
        let canvas = harness.bin.attach_canvas(&CanvasDescriptor::new(1)).expect("attach");
        harness.insert([solid(1).with_appearance(textured(9))]);
        assert_eq!(harness.bin.resource_counts().textures, 1);

        let mut device = RecordingDevice::default();
        harness.render(&canvas, &mut device).expect("render");
        harness.render(&canvas, &mut device).expect("render");
        assert_eq!(device.count(|c| *c == DeviceCall::CreateTexture(TextureId(9))), 1);

        harness.step([MutationMessage::TextureChanged(TextureId(9))]);
        harness.render(&canvas, &mut device).expect("render");
        assert_eq!(device.count(|c| *c == DeviceCall::CreateTexture(TextureId(9))), 2);
    }

    #[test]
    fn test_texture_released_with_its_last_bin() {
        let mut harness = Harness::new(RenderBinConfig::default());
        harness.insert([solid(1).with_appearance(textured(9)), solid(2).with_appearance(textured(9))]);
        assert_eq!(harness.bin.resource_counts().textures, 1);

        harness.remove(&[1]);
        assert_eq!(harness.bin.resource_counts().textures, 1);
        harness.remove(&[2]);
        assert_eq!(harness.bin.resource_counts().textures, 0);
    }

    #[test]
    fn test_shader_change_reaches_the_device() {
        let mut harness = Harness::new(RenderBinConfig::default());
        let canvas = harness.bin.attach_canvas(&CanvasDescriptor::new(1)).expect("attach");
        harness.insert([immediate(1)]);

        let toon = ShaderProgram {
            name: "toon".into(),
            ..ShaderProgram::default()
        };
        harness.step([MutationMessage::ShaderChanged {
            shader: Some(Component::shared(400, toon)),
            atoms: ids(&[1]),
        }]);

        let mut device = RecordingDevice::default();
        harness.render(&canvas, &mut device).expect("render");
        assert!(device.calls.contains(&DeviceCall::SetShader(Some("toon".into()))));
        assert_eq!(harness.bin.bin_counts().shader_bins, 1);
    }

    #[test]
    fn test_alternate_appearance_overrides_the_atom() {
        let mut harness = Harness::new(RenderBinConfig::default());
        harness.insert([solid(1)]);
        assert_eq!(harness.bin.transparent_record_count(), (0, 0));

        harness.environment.set_for_atom(
            DrawAtomId(1),
            ResolvedEnvironment {
                alternate_appearance: Some(glass()),
                ..ResolvedEnvironment::default()
            },
        );
        harness.step([MutationMessage::AlternateAppearanceChanged]);
        assert_eq!(harness.bin.transparent_record_count(), (1, 0));

        harness.environment.clear_atom(DrawAtomId(1));
        harness.step([MutationMessage::AlternateAppearanceChanged]);
        assert_eq!(harness.bin.transparent_record_count(), (0, 0));
    }

    #[test]
    fn test_eye_move_resorts_everything() {
        let mut harness = Harness::new(RenderBinConfig::default());
        let canvas = harness.bin.attach_canvas(&CanvasDescriptor::new(1)).expect("attach");
        harness.insert([
            pane(1, Vec3::new(0.0, 0.0, -2.0)),
            pane(2, Vec3::new(0.0, 0.0, -8.0)),
        ]);
        let mut device = RecordingDevice::default();
        harness.render(&canvas, &mut device).expect("render");
        assert_eq!(device.drawn(), vec![2, 1]);

        // From behind the panes the order flips
        let view = ViewSettings::default().with_eye(Point3::new(0.0, 0.0, -10.0));
        harness.step([MutationMessage::UpdateView(view)]);
        let depths = harness.bin.transparent_depths();
        approx::assert_relative_eq!(depths[0], 64.0, epsilon = 1e-4);
        approx::assert_relative_eq!(depths[1], 4.0, epsilon = 1e-4);

        device.clear_calls();
        harness.render(&canvas, &mut device).expect("render");
        assert_eq!(device.drawn(), vec![1, 2]);
    }
}
