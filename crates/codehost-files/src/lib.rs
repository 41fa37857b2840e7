//! Sandboxed file store for a codehost data root.
//!
//! [`Layout`] fixes where user code, program data, libraries, the recycle
//! bin and the database live. [`PathSandbox`] checks every path argument
//! against those roots, and [`FileStore`] performs the actual operations.

mod archive;
pub mod error;
pub mod layout;
pub mod sandbox;
pub mod store;

pub use error::FileStoreError;
pub use layout::{Layout, Root};
pub use sandbox::PathSandbox;
pub use store::{DirEntry, FileStore, FileStream};
