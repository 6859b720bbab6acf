pub mod error;
pub mod file;
pub mod memory;
pub mod store;

pub use error::StorageError;
pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use store::KeyValueStorage;
