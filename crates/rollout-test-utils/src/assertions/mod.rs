//! Assertion helpers returning descriptive errors

mod jobs;

pub use jobs::*;
