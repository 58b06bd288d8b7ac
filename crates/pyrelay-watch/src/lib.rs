//! Change detection by polling.
//!
//! Two independent sources feed the dispatch layer: a directory scanner that
//! compares modification times between ticks, and a process scanner that
//! spots freshly launched interpreters running a watched file. Neither relies
//! on OS push notifications; callers drive them from their own loops.

pub mod cooldown;
pub mod dir_scan;
pub mod process;

pub use cooldown::UploadCooldown;
pub use dir_scan::{DirectoryScanner, FileEvent};
pub use process::{default_process_source, ProcessInfo, ProcessScanner, ProcessSource, RunEvent};
