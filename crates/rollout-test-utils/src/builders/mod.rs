//! Builders for entity payloads and event envelopes.

mod entity;
pub mod rules;

pub use entity::*;
