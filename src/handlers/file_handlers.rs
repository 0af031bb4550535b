//! HTTP handlers for `/files`.
//!
//! Downloads are streamed straight from the blob store; every storage
//! concern is delegated to `FileService`.

use crate::{
    errors::AppError,
    models::file_record::FileRecord,
    services::file_service::{FileService, NewBlob},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State, multipart::MultipartRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// `metadata` may be sent as a query parameter instead of a form field.
#[derive(Debug, Deserialize)]
pub struct MetadataQuery {
    pub metadata: Option<String>,
}

/// Fields pulled out of a multipart upload form.
#[derive(Debug, Default)]
struct FileForm {
    file: Option<NewBlob>,
    metadata: Option<String>,
}

async fn read_form(mut multipart: Multipart) -> Result<FileForm, AppError> {
    let mut form = FileForm::default();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await?;
                form.file = Some(NewBlob {
                    data,
                    file_name,
                    content_type,
                });
            }
            "metadata" => form.metadata = Some(field.text().await?),
            other => debug!("ignoring multipart field `{}`", other),
        }
    }
    Ok(form)
}

/// `GET /files`: every stored file's record.
pub async fn list_files(
    State(service): State<FileService>,
) -> Result<Json<Vec<FileRecord>>, AppError> {
    Ok(Json(service.list().await?))
}

/// `POST /files/upload`: multipart form with a `file` part and optional
/// `metadata`. Responds with the new file id.
pub async fn upload_file(
    State(service): State<FileService>,
    Query(query): Query<MetadataQuery>,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let form = read_form(multipart).await?;
    let file = form
        .file
        .ok_or_else(|| AppError::bad_request("Required part 'file' is not present"))?;

    let id = service.upload(file, form.metadata.or(query.metadata)).await?;
    Ok((StatusCode::OK, id))
}

/// `GET /files/{id}`: stream the payload as `application/octet-stream`.
pub async fn get_file(
    State(service): State<FileService>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let fetched = service.fetch(&id).await?;
    let body = Body::from_stream(ReaderStream::new(fetched.reader));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(fetched.record.size.max(0)),
    );
    Ok(response)
}

/// `DELETE /files/{id}`
pub async fn delete_file(
    State(service): State<FileService>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    service.delete(&id).await?;
    Ok((StatusCode::ACCEPTED, "File Deleted"))
}

/// `PUT /files/{id}`: optional `file` part and/or optional `metadata`.
/// A request without a multipart body only updates metadata from the query.
pub async fn update_file(
    State(service): State<FileService>,
    Path(id): Path<String>,
    Query(query): Query<MetadataQuery>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<impl IntoResponse, AppError> {
    let form = match multipart {
        Ok(multipart) => read_form(multipart).await?,
        Err(rejection) => {
            debug!("update of {} without multipart body: {}", id, rejection);
            FileForm::default()
        }
    };

    service
        .replace(&id, form.file, form.metadata.or(query.metadata))
        .await?;
    Ok((StatusCode::OK, "Updated the file"))
}
