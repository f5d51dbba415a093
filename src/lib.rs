// Library surface for headless/integration tests and the terminal client.
// The ratatui screens stay in the binary.
pub mod api;
pub mod app_dirs;
pub mod attempt;
pub mod capture;
pub mod config;
pub mod error;
pub mod journal;
pub mod keystroke;
pub mod letter_stats;
pub mod logging;
pub mod metrics;
pub mod runtime;
pub mod session;
pub mod submission;
pub mod test_definition;
pub mod util;

pub use error::{ProctorError, ProctorResult};
