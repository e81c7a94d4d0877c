//! Foundational low-level utilities shared across Parley crates.
//!
//! Provides atomic file-write helpers, epoch timestamps, and the text
//! truncation helper used for log previews.

pub mod atomic_io;
pub mod text_utils;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use text_utils::truncate_chars;
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms};
