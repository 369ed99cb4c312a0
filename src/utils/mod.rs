//! Utility functions and helpers
//!
//! This module contains clock utilities and crash-safe file helpers.

pub mod atomic;
pub mod time;

pub use time::{current_millis, MonotonicClock};
