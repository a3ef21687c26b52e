//! # Render Bin Configuration
//!
//! Tuning parameters for the bin hierarchy, the transparency depth sort and
//! the compaction policy. The thresholds here have no derivation beyond
//! measurement, so every one of them is a field rather than a constant.
//!
//! ## Configuration Categories
//!
//! - **Capacity**: simultaneous device lights, device context slots
//! - **Transparency**: sort mode, direction, incremental resort threshold
//! - **Compaction**: scan interval, not-visible window, dead:alive ratio

use serde::{Deserialize, Serialize};

pub use crate::config::{Config, ConfigError, ConfigFormat};

/// Highest number of device contexts a creation bitmask can describe
pub const MAX_CONTEXT_BITS: usize = 32;

/// Highest light capacity a light-slot enable mask can describe
pub const MAX_LIGHT_SLOTS: usize = u32::BITS as usize;

/// How transparent geometry is ordered before drawing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransparencySortMode {
    /// One record per transparent molecule, drawn in insertion order
    None,
    /// One record per transparent geometry piece, sorted by eye distance
    #[default]
    Geometry,
}

/// Direction of the depth-sorted transparency list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    /// Farthest first: each node's depth is `>=` the next node's
    #[default]
    BackToFront,
    /// Nearest first: each node's depth is `<=` the next node's
    FrontToBack,
}

/// # Transparency Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransparencyConfig {
    /// Initial sort mode; views can switch it at runtime
    pub sort_mode: TransparencySortMode,
    /// Direction of the sorted list
    pub order: SortOrder,
    /// Incremental merge is used while `dirty / live` stays below this fraction
    pub incremental_threshold: f32,
    /// Disable depth writes while drawing the transparency list
    pub freeze_depth_writes: bool,
}

impl TransparencyConfig {
    /// Create the default transparency configuration
    pub fn new() -> Self {
        Self {
            sort_mode: TransparencySortMode::Geometry,
            order: SortOrder::BackToFront,
            incremental_threshold: 2.0 / 3.0,
            freeze_depth_writes: true,
        }
    }

    /// Set the sort mode
    pub fn with_sort_mode(mut self, mode: TransparencySortMode) -> Self {
        self.sort_mode = mode;
        self
    }

    /// Set the sort direction
    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    /// Set the incremental resort threshold
    pub fn with_incremental_threshold(mut self, threshold: f32) -> Self {
        self.incremental_threshold = threshold;
        self
    }
}

impl Default for TransparencyConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// # Compaction Configuration
///
/// Long-unseen atoms are dropped from tracking to bound memory. Turning this
/// off only costs memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Whether the periodic scan runs at all
    pub enabled: bool,
    /// Processed frames between scans
    pub interval_frames: u64,
    /// Frames without being visible after which an atom counts as dead
    pub not_visible_frames: u64,
    /// Compaction runs when `alive * ratio < dead`
    pub dead_to_alive_ratio: u64,
}

impl CompactionConfig {
    /// Create the default compaction configuration
    pub fn new() -> Self {
        Self {
            enabled: true,
            interval_frames: 150,
            not_visible_frames: 75,
            dead_to_alive_ratio: 2,
        }
    }

    /// Disable compaction
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// Set scan interval and not-visible window
    pub fn with_windows(mut self, interval_frames: u64, not_visible_frames: u64) -> Self {
        self.interval_frames = interval_frames;
        self.not_visible_frames = not_visible_frames;
        self
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// # Render Bin Configuration
///
/// Top-level configuration for one view's render bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderBinConfig {
    /// Maximum simultaneous lights the device supports (LightBin capacity)
    pub max_lights: usize,
    /// Maximum distinct device contexts
    pub max_contexts: usize,
    /// Transparency sorting
    pub transparency: TransparencyConfig,
    /// Tracking-list compaction
    pub compaction: CompactionConfig,
}

impl RenderBinConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self {
            max_lights: 8,
            max_contexts: MAX_CONTEXT_BITS,
            transparency: TransparencyConfig::default(),
            compaction: CompactionConfig::default(),
        }
    }

    /// Set the device light capacity
    pub fn with_max_lights(mut self, max_lights: usize) -> Self {
        self.max_lights = max_lights;
        self
    }

    /// Set the transparency configuration
    pub fn with_transparency(mut self, transparency: TransparencyConfig) -> Self {
        self.transparency = transparency;
        self
    }

    /// Set the compaction configuration
    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }
}

impl Default for RenderBinConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Config for RenderBinConfig {
    /// Capacity limits, threshold range and a non-zero compaction cadence
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_lights == 0 || self.max_lights > MAX_LIGHT_SLOTS {
            return Err(ConfigError::Invalid(format!(
                "max_lights must be within 1..={MAX_LIGHT_SLOTS}"
            )));
        }
        if self.max_contexts == 0 || self.max_contexts > MAX_CONTEXT_BITS {
            return Err(ConfigError::Invalid(format!(
                "max_contexts must be within 1..={MAX_CONTEXT_BITS}"
            )));
        }
        let threshold = self.transparency.incremental_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "incremental_threshold {threshold} must be within (0, 1]"
            )));
        }
        let compaction = &self.compaction;
        if compaction.enabled && (compaction.interval_frames == 0 || compaction.dead_to_alive_ratio == 0) {
            return Err(ConfigError::Invalid(
                "compaction interval and ratio must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
