//! Tracing subscriber setup shared by everything that embeds the probing engine.

mod subscriber;

pub use subscriber::{init, init_for_tests, init_with_level};
