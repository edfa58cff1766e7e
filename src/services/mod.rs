pub mod blob_backend;
pub mod finalizer;
