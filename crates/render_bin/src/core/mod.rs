//! Core module - configuration shared by every subsystem

pub mod config;

pub use config::{
    CompactionConfig, RenderBinConfig, SortOrder, TransparencyConfig, TransparencySortMode,
    MAX_CONTEXT_BITS,
};
