use axum::{
    extract::{Multipart, Path, State},
    http::header,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use tracing::info;

use super::{AppState, CurrentUser};
use crate::blob_store::Folder;
use crate::error::ServerError;

#[derive(Serialize)]
pub struct UploadResponse {
    url: String,
}

/// Store the multipart `file` field and return its public URL.
pub async fn upload(
    State(state): State<AppState>,
    caller: CurrentUser,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ServerError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadInput(format!("Invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let original_name = field.file_name().unwrap_or("upload").to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ServerError::BadInput(format!("Failed to read file: {e}")))?;

        let stored = state
            .storage
            .put(Folder::Uploads, &original_name, &data)
            .await?;
        info!(user_id = %caller.user.id, key = %stored.key, size = data.len(), "File uploaded");

        return Ok(Json(UploadResponse {
            url: format!("{}/api/files/{}", state.config.backend_url, stored.name),
        }));
    }

    Err(ServerError::BadInput("Missing file field".into()))
}

pub async fn get_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    serve_object(&state, Folder::Uploads, &filename).await
}

/// Avatars, stored under `avatar/`.
pub async fn get_image(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    serve_object(&state, Folder::Avatars, &filename).await
}

async fn serve_object(
    state: &AppState,
    folder: Folder,
    name: &str,
) -> Result<impl IntoResponse, ServerError> {
    let (data, content_type) = state.storage.get(folder, name).await?;
    Ok(([(header::CONTENT_TYPE, content_type)], data))
}
