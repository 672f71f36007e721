//! Rich terminal display utilities for CLI output.
//!
//! Provides styled tables, phase progress bars and the color theme.

pub mod progress;
pub mod tables;
pub mod theme;

pub use progress::{PhaseGuard, ProgressStack, create_progress_bar, create_spinner, with_spinner};
pub use tables::{TableBuilder, create_build_table, create_search_table};
pub use theme::{THEME, Theme, format_bytes};
