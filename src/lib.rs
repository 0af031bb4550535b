//! File storage service: uploaded payloads on local disk, one metadata
//! record per payload in SQLite, kept consistent by `FileService`.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

use axum::Router;
use services::file_service::FileService;

/// The complete HTTP application with its state attached.
pub fn app(service: FileService, max_body_bytes: usize) -> Router {
    routes::routes::routes(max_body_bytes).with_state(service)
}
