//! Tracking-list compaction
//!
//! Atoms that have not been visible for a while keep their tracking entry so
//! they can re-enter cheaply. When such dead entries outnumber live ones by
//! the configured ratio, they are dropped.

use crate::core::config::CompactionConfig;
use crate::render::atom::RenderAtom;
use crate::render::bins::AtomKey;
use crate::render::flags::AtomFlags;

/// Decides when and what to compact
#[derive(Debug, Clone)]
pub struct CompactionPolicy {
    config: CompactionConfig,
    frames_since_scan: u64,
}

impl CompactionPolicy {
    /// Policy with the given configuration
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            config,
            frames_since_scan: 0,
        }
    }

    /// Count one processed frame; `true` when a scan is due
    pub fn tick(&mut self) -> bool {
        if !self.config.enabled {
            return false;
        }
        self.frames_since_scan += 1;
        if self.frames_since_scan >= self.config.interval_frames {
            self.frames_since_scan = 0;
            true
        } else {
            false
        }
    }

    /// Out of the bins, not visible, and unseen for longer than the window
    pub fn is_dead(&self, atom: &RenderAtom, frame: u64) -> bool {
        !atom.flags.intersects(AtomFlags::IN_BIN | AtomFlags::VISIBLE)
            && frame.saturating_sub(atom.last_visible_frame) > self.config.not_visible_frames
    }

    /// Whether `dead` outweighs `alive` enough to compact
    pub fn should_compact(&self, alive: usize, dead: usize) -> bool {
        (alive as u64).saturating_mul(self.config.dead_to_alive_ratio) < dead as u64
    }

    /// Dead atoms to drop, or `None` when the threshold is not reached
    pub fn scan<'a>(&self, atoms: impl Iterator<Item = (AtomKey, &'a RenderAtom)>, frame: u64) -> Option<Vec<AtomKey>> {
        let mut alive = 0;
        let mut dead = Vec::new();
        for (key, atom) in atoms {
            if self.is_dead(atom, frame) {
                dead.push(key);
            } else {
                alive += 1;
            }
        }
        log::trace!("Compaction scan at frame {frame}: {alive} alive, {} dead", dead.len());
        self.should_compact(alive, dead.len()).then_some(dead)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::foundation::collections::SlotMap;
    use crate::foundation::math::Mat4;
    use crate::scene::DrawAtom;

    fn tracked(fresh: usize, stale: usize) -> SlotMap<AtomKey, RenderAtom> {
        let mut atoms = SlotMap::with_key();
        for i in 0..fresh + stale {
            let last_seen = if i < fresh { 190 } else { 10 };
            atoms.insert(RenderAtom::new(Arc::new(DrawAtom::new(i as u64, Vec::new())), &Mat4::identity(), last_seen));
        }
        atoms
    }

    #[test]
    fn test_interval_gates_scans() {
        let mut policy = CompactionPolicy::new(CompactionConfig::new().with_windows(3, 1));
        assert!(!policy.tick());
        assert!(!policy.tick());
        assert!(policy.tick());
        assert!(!policy.tick());
        assert!(!CompactionPolicy::new(CompactionConfig::disabled()).tick());
    }

    #[test]
    fn test_eighty_dead_twenty_alive_compacts() {
        let policy = CompactionPolicy::new(CompactionConfig::default());
        let atoms = tracked(20, 80);
        let dead = policy.scan(atoms.iter(), 200).unwrap();
        assert_eq!(dead.len(), 80);
    }

    #[test]
    fn test_below_ratio_keeps_everything() {
        let policy = CompactionPolicy::new(CompactionConfig::default());
        let atoms = tracked(50, 50);
        assert!(policy.scan(atoms.iter(), 200).is_none());
        assert!(policy.should_compact(0, 1));
        assert!(!policy.should_compact(10, 20));
    }
}
