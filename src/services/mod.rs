pub mod blob_store;
pub mod file_service;
pub mod key_locks;
pub mod metadata_index;
pub mod retry;
