//! Structural properties of the bin hierarchy across updates
//!
//! Molecule sharing, insert/remove round trips, depth ordering, per-context
//! resource release, share group changes, compaction and light-bin capacity.

use super::fixtures::*;
use crate::core::config::{CompactionConfig, RenderBinConfig, MAX_LIGHT_SLOTS};
use crate::foundation::math::{Mat4, Point3, Vec3};
use crate::render::atom::AtomState;
use crate::render::canvas::CanvasDescriptor;
use crate::render::error::RenderBinError;
use crate::render::messages::{MessageBus, MutationMessage};
use crate::render::render_bin::{Collaborators, RenderBin};
use crate::render::transparency::ResortKind;
use crate::scene::{
    AllRegistered, Appearance, Component, DrawAtomId, Light, LightId, Material, ResolvedEnvironment,
    ScopedEnvironment, TransformGroupId, ViewSettings,
};
use approx::assert_relative_eq;
use std::sync::Arc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_values_share_one_molecule() {
        let mut harness = Harness::new(RenderBinConfig::default());
        // Two distinct component objects with equal values
        let first = Arc::new(Appearance::default().with_material(Component::shared(1, Material::diffuse(0.2, 0.4, 0.6))));
        let second = Arc::new(Appearance::default().with_material(Component::shared(2, Material::diffuse(0.2, 0.4, 0.6))));
        let stats = harness.insert([solid(1).with_appearance(first), solid(2).with_appearance(second)]);
        assert_eq!(stats.inserted, 2);

        let a = harness.bin.chain_of(DrawAtomId(1)).expect("atom 1 binned");
        let b = harness.bin.chain_of(DrawAtomId(2)).expect("atom 2 binned");
        assert_eq!(a, b);
        assert_eq!(harness.bin.bin_counts().molecules, 1);
    }

    #[test]
    fn test_different_material_gets_its_own_molecule() {
        let mut harness = Harness::new(RenderBinConfig::default());
        harness.insert([
            solid(1).with_appearance(painted(1.0, 0.0, 0.0)),
            solid(2).with_appearance(painted(0.0, 1.0, 0.0)),
        ]);

        let a = harness.bin.chain_of(DrawAtomId(1)).expect("atom 1 binned");
        let b = harness.bin.chain_of(DrawAtomId(2)).expect("atom 2 binned");
        assert_eq!(a.texture_bin, b.texture_bin);
        assert_ne!(a.molecule, b.molecule);
        let counts = harness.bin.bin_counts();
        assert_eq!(counts.light_bins, 1);
        assert_eq!(counts.texture_bins, 1);
        assert_eq!(counts.molecules, 2);
    }

    #[test]
    fn test_remove_then_reinsert_restores_bins() {
        let mut harness = Harness::new(RenderBinConfig::default());
        harness.insert([solid(1), solid(2), solid(3)]);
        let before = harness.bin.chain_of(DrawAtomId(2)).expect("binned");

        let stats = harness.remove(&[2]);
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.forgotten, 1);
        assert_eq!(harness.bin.atom_state(DrawAtomId(2)), None);
        assert_eq!(harness.bin.chain_of(DrawAtomId(1)).map(|c| c.molecule), Some(before.molecule));

        harness.insert([solid(2)]);
        assert_eq!(harness.bin.atom_state(DrawAtomId(2)), Some(AtomState::InBin));
        assert_eq!(harness.bin.chain_of(DrawAtomId(2)), Some(before));
        assert_eq!(harness.bin.bin_counts().molecules, 1);
    }

    #[test]
    fn test_remove_and_insert_in_one_update() {
        let mut harness = Harness::new(RenderBinConfig::default());
        harness.insert([solid(1)]);

        let stats = harness.step([
            MutationMessage::RemoveNodes(ids(&[1])),
            MutationMessage::InsertNodes(vec![Arc::new(solid(1))]),
        ]);
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.forgotten, 0);
        assert_eq!(harness.bin.atom_state(DrawAtomId(1)), Some(AtomState::InBin));
        assert_eq!(harness.bin.tracked_count(), 1);
    }

    #[test]
    fn test_emptied_chain_is_released() {
        let mut harness = Harness::new(RenderBinConfig::default());
        harness.insert([solid(1)]);
        assert_eq!(harness.bin.bin_counts().molecules, 1);

        let stats = harness.remove(&[1]);
        assert!(stats.released_bins >= 1);
        let counts = harness.bin.bin_counts();
        assert_eq!(counts.light_bins, 0);
        assert_eq!(counts.env_sets, 0);
        assert_eq!(counts.molecules, 0);
    }

    #[test]
    fn test_transparent_depths_back_to_front() {
        let mut harness = Harness::new(RenderBinConfig::default());
        let stats = harness.insert([
            pane(1, Vec3::new(0.0, 0.0, -5.0)),
            pane(2, Vec3::new(0.0, 0.0, -1.0)),
            pane(3, Vec3::new(0.0, 0.0, -9.0)),
            pane(4, Vec3::new(0.0, 0.0, -3.0)),
        ]);
        assert_eq!(stats.resort, ResortKind::Full);
        let depths = harness.bin.transparent_depths();
        assert_eq!(depths.len(), 4);
        for (depth, expected) in depths.iter().zip([81.0, 25.0, 9.0, 1.0]) {
            assert_relative_eq!(*depth, expected, epsilon = 1e-4);
        }

        // One moved record resorts incrementally
        let moved = Mat4::new_translation(&Vec3::new(0.0, 0.0, -7.0));
        let stats = harness.step([MutationMessage::TransformChanged(vec![(TransformGroupId(2), moved)])]);
        assert_eq!(stats.resort, ResortKind::Incremental);
        let incremental = harness.bin.transparent_depths();
        for (depth, expected) in incremental.iter().zip([81.0, 49.0, 25.0, 9.0]) {
            assert_relative_eq!(*depth, expected, epsilon = 1e-4);
        }

        // Same order as building the final scene from scratch
        let mut fresh = Harness::new(RenderBinConfig::default());
        fresh.insert([
            pane(1, Vec3::new(0.0, 0.0, -5.0)),
            pane(2, Vec3::new(0.0, 0.0, -7.0)),
            pane(3, Vec3::new(0.0, 0.0, -9.0)),
            pane(4, Vec3::new(0.0, 0.0, -3.0)),
        ]);
        for (a, b) in incremental.iter().zip(fresh.bin.transparent_depths()) {
            assert_relative_eq!(*a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_view_update_resorts_only_when_sort_inputs_change() {
        let mut harness = Harness::new(RenderBinConfig::default());
        harness.insert([pane(1, Vec3::new(0.0, 0.0, -2.0)), pane(2, Vec3::new(0.0, 0.0, -4.0))]);

        let stats = harness.step([MutationMessage::UpdateView(ViewSettings::default())]);
        assert_eq!(stats.resort, ResortKind::Unchanged);

        let behind = ViewSettings::default().with_eye(Point3::new(0.0, 0.0, -10.0));
        let stats = harness.step([MutationMessage::UpdateView(behind)]);
        assert_eq!(stats.resort, ResortKind::Full);
        for (depth, expected) in harness.bin.transparent_depths().iter().zip([64.0, 36.0]) {
            assert_relative_eq!(*depth, expected, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_removed_transparent_atom_leaves_the_list() {
        let mut harness = Harness::new(RenderBinConfig::default());
        harness.insert([pane(1, Vec3::new(0.0, 0.0, -2.0)), pane(2, Vec3::new(0.0, 0.0, -4.0))]);
        assert_eq!(harness.bin.transparent_record_count(), (2, 0));

        harness.remove(&[1]);
        assert_eq!(harness.bin.transparent_record_count(), (1, 0));
        assert_relative_eq!(harness.bin.transparent_depths()[0], 16.0, epsilon = 1e-4);
    }

    #[test]
    fn test_list_released_once_every_context_freed_it() {
        let mut harness = Harness::new(RenderBinConfig::default());
        let first = harness.bin.attach_canvas(&CanvasDescriptor::new(1)).expect("attach");
        let second = harness.bin.attach_canvas(&CanvasDescriptor::new(2)).expect("attach");
        assert_ne!(first.context_bit(), second.context_bit());

        harness.insert([solid(1)]);
        assert_eq!(harness.bin.resource_counts().molecule_lists, 1);
        let mut device = RecordingDevice::default();
        harness.render(&first, &mut device).expect("render");
        harness.render(&second, &mut device).expect("render");
        assert_eq!(device.count(|c| matches!(c, DeviceCall::CreateDrawList(..))), 2);

        harness.remove(&[1]);
        assert_eq!(first.pending_free_count(), 1);
        assert_eq!(second.pending_free_count(), 1);
        assert_eq!(harness.bin.resource_counts().retiring, 1);

        harness.render(&first, &mut device).expect("render");
        let stats = harness.step([]);
        assert_eq!(stats.resources_released, 1);
        let counts = harness.bin.resource_counts();
        assert_eq!(counts.molecule_free, 0);
        assert_eq!(counts.retiring, 1);

        harness.render(&second, &mut device).expect("render");
        let stats = harness.step([]);
        assert_eq!(stats.resources_released, 1);
        let counts = harness.bin.resource_counts();
        assert_eq!(counts.molecule_lists, 0);
        assert_eq!(counts.molecule_free, 1);
        assert_eq!(counts.retiring, 0);

        assert_eq!(harness.step([]).resources_released, 0);
        assert_eq!(device.count(|c| matches!(c, DeviceCall::FreeDrawList(..))), 2);
    }

    #[test]
    fn test_share_group_frees_once() {
        let mut harness = Harness::new(RenderBinConfig::default());
        let first = harness.bin.attach_canvas(&CanvasDescriptor::new(1).shared(7)).expect("attach");
        let second = harness.bin.attach_canvas(&CanvasDescriptor::new(2).shared(7)).expect("attach");
        assert_eq!(first.context_bit(), second.context_bit());

        harness.insert([solid(1)]);
        let mut device = RecordingDevice::default();
        harness.render(&first, &mut device).expect("render");
        harness.render(&second, &mut device).expect("render");
        assert_eq!(device.count(|c| matches!(c, DeviceCall::CreateDrawList(..))), 1);

        harness.remove(&[1]);
        assert_eq!(first.pending_free_count() + second.pending_free_count(), 1);
    }

    #[test]
    fn test_share_group_change_moves_the_context() {
        let mut harness = Harness::new(RenderBinConfig::default());
        let first = harness.bin.attach_canvas(&CanvasDescriptor::new(1).shared(7)).expect("attach");
        let second = harness.bin.attach_canvas(&CanvasDescriptor::new(2).shared(7)).expect("attach");
        harness.insert([solid(1)]);
        let mut device = RecordingDevice::default();
        harness.render(&first, &mut device).expect("render");
        harness.render(&second, &mut device).expect("render");
        let creates = |device: &RecordingDevice| device.count(|c| matches!(c, DeviceCall::CreateDrawList(..)));
        assert_eq!(creates(&device), 1);

        // On a context of its own the second canvas compiles its own list
        harness.bin.set_share_group(second.id(), None).expect("leave group");
        assert_ne!(first.context_bit(), second.context_bit());
        harness.render(&second, &mut device).expect("render");
        harness.render(&first, &mut device).expect("render");
        assert_eq!(creates(&device), 2);

        // Back in the group it reuses the first canvas's list
        harness.bin.set_share_group(second.id(), Some(7)).expect("rejoin group");
        assert_eq!(first.context_bit(), second.context_bit());
        harness.render(&second, &mut device).expect("render");
        assert_eq!(creates(&device), 2);
        assert_eq!(harness.bin.check_invariants(), Ok(()));
    }

    #[test]
    fn test_share_group_change_without_free_context_fails() {
        let mut config = RenderBinConfig::default();
        config.max_contexts = 1;
        let mut harness = Harness::new(config);
        harness.bin.attach_canvas(&CanvasDescriptor::new(1).shared(7)).expect("attach");
        let second = harness.bin.attach_canvas(&CanvasDescriptor::new(2).shared(7)).expect("attach");

        let result = harness.bin.set_share_group(second.id(), None);
        assert!(matches!(result, Err(RenderBinError::ContextLimitExceeded(1))));
        assert_eq!(second.share_group(), Some(7));
        assert_eq!(second.context_bit(), 0);
    }

    #[test]
    fn test_uncreated_list_returns_immediately() {
        let mut harness = Harness::new(RenderBinConfig::default());
        harness.bin.attach_canvas(&CanvasDescriptor::new(1)).expect("attach");
        harness.insert([solid(1)]);

        // Never rendered, so no context holds the list
        harness.remove(&[1]);
        let counts = harness.bin.resource_counts();
        assert_eq!(counts.molecule_lists, 0);
        assert_eq!(counts.molecule_free, 1);
        assert_eq!(counts.retiring, 0);
    }

    #[test]
    fn test_shared_geometry_gets_a_piece_list() {
        let mut harness = Harness::new(RenderBinConfig::default());
        let shared = piece(7, crate::foundation::math::Point3::origin());
        harness.insert([
            crate::scene::DrawAtom::new(1, vec![Arc::clone(&shared)]),
            crate::scene::DrawAtom::new(2, vec![Arc::clone(&shared)]),
        ]);

        let counts = harness.bin.resource_counts();
        assert_eq!(counts.shared_geometries, 1);
        assert_eq!(counts.piece_lists, 1);
        assert_eq!(counts.molecule_lists, 0);

        let canvas = harness.bin.attach_canvas(&CanvasDescriptor::new(1)).expect("attach");
        let mut device = RecordingDevice::default();
        harness.render(&canvas, &mut device).expect("render");
        assert_eq!(device.count(|c| matches!(c, DeviceCall::CreateDrawList(_, 1))), 1);
        assert_eq!(device.count(|c| matches!(c, DeviceCall::CallDrawList(..))), 2);
    }

    #[test]
    fn test_compaction_drops_long_invisible_atoms() {
        let config = RenderBinConfig::new().with_compaction(CompactionConfig::new().with_windows(10, 5));
        let mut harness = Harness::with_candidates(config);
        harness.candidates.set((0..100).map(DrawAtomId));
        harness.insert((0..100).map(solid));
        assert_eq!(harness.bin.tracked_count(), 100);

        harness.candidates.set((0..20).map(DrawAtomId));
        let mut compacted = 0;
        for _ in 0..12 {
            compacted += harness.step([]).compacted;
        }
        assert_eq!(compacted, 80);
        assert_eq!(harness.bin.tracked_count(), 20);
        assert_eq!(harness.bin.registered_count(), 100);

        // A compacted atom comes back when it turns visible again
        harness.candidates.show(DrawAtomId(50));
        harness.step([]);
        assert_eq!(harness.bin.atom_state(DrawAtomId(50)), Some(AtomState::InBin));
    }

    #[test]
    fn test_light_bins_respect_capacity() {
        let mut harness = Harness::new(RenderBinConfig::new().with_max_lights(2));
        harness
            .environment
            .set_for_atom(DrawAtomId(1), ResolvedEnvironment::with_lights([LightId(1), LightId(2)]));
        harness
            .environment
            .set_for_atom(DrawAtomId(2), ResolvedEnvironment::with_lights([LightId(3)]));
        harness.insert([solid(1), solid(2)]);
        assert_eq!(harness.bin.bin_counts().light_bins, 2);
        assert_eq!(harness.bin.bin_counts().env_sets, 2);

        // Fits beside {1, 2} without a new light bin
        harness
            .environment
            .set_for_atom(DrawAtomId(3), ResolvedEnvironment::with_lights([LightId(1)]));
        harness.insert([solid(3)]);
        let counts = harness.bin.bin_counts();
        assert_eq!(counts.light_bins, 2);
        assert_eq!(counts.env_sets, 3);
        let one = harness.bin.chain_of(DrawAtomId(1)).expect("binned");
        let three = harness.bin.chain_of(DrawAtomId(3)).expect("binned");
        assert_eq!(one.light_bin, three.light_bin);
        assert_ne!(one.env_set, three.env_set);
    }

    #[test]
    fn test_light_set_at_full_slot_width() {
        let mut harness = Harness::new(RenderBinConfig::new().with_max_lights(MAX_LIGHT_SLOTS));
        let canvas = harness.bin.attach_canvas(&CanvasDescriptor::new(1)).expect("attach");
        let count = MAX_LIGHT_SLOTS as u64;
        harness.environment.set_global(ResolvedEnvironment::with_lights((0..count).map(LightId)));
        harness.step((0..count).map(|id| MutationMessage::LightChanged {
            light: Light::directional(id, Vec3::new(0.0, -1.0, 0.0), Vec3::new(1.0, 1.0, 1.0)),
            scope_changed: false,
        }));
        harness.insert([solid(1)]);
        assert_eq!(harness.bin.bin_counts().light_bins, 1);

        let mut device = RecordingDevice::default();
        harness.render(&canvas, &mut device).expect("render");
        assert!(device.calls.contains(&DeviceCall::SetLights(MAX_LIGHT_SLOTS, u32::MAX)));
    }

    #[test]
    fn test_light_capacity_past_slot_width_is_rejected() {
        let collaborators = Collaborators {
            visibility: Arc::new(AllRegistered),
            environment: Arc::new(ScopedEnvironment::new()),
        };
        let config = RenderBinConfig::new().with_max_lights(MAX_LIGHT_SLOTS + 8);
        let result = RenderBin::new(config, collaborators, MessageBus::new().subscribe());
        assert!(matches!(result, Err(RenderBinError::Config(_))));
    }

    #[test]
    fn test_scope_change_rebins_affected_atoms() {
        let mut harness = Harness::new(RenderBinConfig::default());
        harness.environment.set_global(ResolvedEnvironment::with_lights([LightId(1)]));
        harness.insert([solid(1)]);
        let before = harness.bin.chain_of(DrawAtomId(1)).expect("binned");

        harness.environment.set_global(ResolvedEnvironment::with_lights([LightId(2)]));
        let light = Light::directional(2, Vec3::new(0.0, -1.0, 0.0), Vec3::new(1.0, 1.0, 1.0));
        let stats = harness.step([MutationMessage::LightChanged {
            light,
            scope_changed: true,
        }]);
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.inserted, 1);
        let after = harness.bin.chain_of(DrawAtomId(1)).expect("binned");
        assert_ne!(before.env_set, after.env_set);
        assert_eq!(harness.bin.bin_counts().env_sets, 1);
    }

    #[test]
    fn test_contents_only_light_change_keeps_bins() {
        let mut harness = Harness::new(RenderBinConfig::default());
        harness.environment.set_global(ResolvedEnvironment::with_lights([LightId(1)]));
        harness.insert([solid(1)]);
        let before = harness.bin.chain_of(DrawAtomId(1));

        let light = crate::scene::Light::directional(1, Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.5, 0.5, 0.5));
        let stats = harness.step([MutationMessage::LightChanged {
            light,
            scope_changed: false,
        }]);
        assert_eq!(stats.removed, 0);
        assert_eq!(harness.bin.chain_of(DrawAtomId(1)), before);
    }
}
