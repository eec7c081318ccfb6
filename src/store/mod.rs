//! Persistence layer.
//!
//! [`RecordStore`] is the typed surface used by the service. It sits on a
//! [`KvBackend`]: either the volatile [`MemoryBackend`] or the directory-based
//! [`FileBackend`].

mod backend;
mod file;
mod records;

pub use backend::{KvBackend, MemoryBackend};
pub use file::{FileBackend, StoreConfig};
pub use records::RecordStore;
