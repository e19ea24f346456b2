//! Storage layer
//!
//! Persists verified piece data. The backend trait keeps the piece
//! engine independent of where bytes land; the file backend writes to
//! the local disk.

pub mod backend;
pub mod file;

pub use backend::StorageBackend;
pub use file::FileStorage;
