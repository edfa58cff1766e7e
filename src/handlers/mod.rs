pub mod blob_handlers;
pub mod health_handlers;
pub mod project_handlers;
