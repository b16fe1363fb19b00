pub mod file_storage;
pub mod in_memory_storage;

// Re-export both storage types
pub use file_storage::FileStorage;
pub use in_memory_storage::InMemoryStorage;
