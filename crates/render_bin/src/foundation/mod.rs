//! Foundation module - Core utilities and types
//!
//! This module provides fundamental utilities used throughout the crate:
//! - Math types and bounding volumes
//! - Arena-backed linked lists and id pools
//! - Logging utilities

pub mod collections;
pub mod logging;
pub mod math;
