//! Media model
//!
//! This module provides:
//! - Session/media/format descriptions shared by publishers and readers
//! - The media unit type that flows through streams

pub mod description;
pub mod unit;

pub use description::{Format, FormatKind, MediaDescription, MediaType, SessionDescription};
pub use unit::Unit;
