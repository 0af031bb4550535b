//! Routes for the file API.
//!
//! - `GET    /files`             list every file record
//! - `POST   /files/upload`      upload a file (multipart)
//! - `GET    /files/{id}`        download a file
//! - `PUT    /files/{id}`        replace payload and/or metadata (multipart)
//! - `DELETE /files/{id}`        delete a file
//! - `GET    /healthz`, `/readyz` probes

use crate::{
    handlers::{
        file_handlers::{delete_file, get_file, list_files, update_file, upload_file},
        health_handlers::{healthz, readyz},
    },
    services::file_service::FileService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. Every handler shares the `FileService` state.
///
/// `max_body_bytes` bounds upload and replace request bodies.
pub fn routes(max_body_bytes: usize) -> Router<FileService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/files", get(list_files))
        .route("/files/upload", post(upload_file))
        .route(
            "/files/{id}",
            get(get_file).put(update_file).delete(delete_file),
        )
        .layer(DefaultBodyLimit::max(max_body_bytes))
}
