//! Codehost: sandboxed file management and script execution for a
//! hosted code environment.

pub mod config;
pub mod tasks;

pub use codehost_files as files;
