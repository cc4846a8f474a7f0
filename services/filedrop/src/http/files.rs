//! Listing and download handlers

use super::{pages, AppState};
use crate::storage::{ListFilter, ObjectStore, StoreError};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use metrics::counter;
use serde::Deserialize;
use std::collections::HashSet;
use tokio_util::io::ReaderStream;
use tracing::{error, info, instrument};

#[derive(Debug, Default, Deserialize)]
pub struct FilesQuery {
    /// Only list objects uploaded with this client id
    pub client_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    pub filename: Option<String>,
}

/// `GET /files`
#[instrument(skip(state))]
pub async fn list_files(State(state): State<AppState>, Query(query): Query<FilesQuery>) -> Response {
    let filter = ListFilter {
        client_id: query.client_id.filter(|client_id| !client_id.is_empty()),
    };

    match collect_names(state.store.as_ref(), filter.clone()).await {
        Ok(names) => pages::file_list(&names, filter.client_id.as_deref()).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to list stored objects");
            (StatusCode::INTERNAL_SERVER_ERROR, "Error listing files").into_response()
        }
    }
}

/// Stored names in listing order, each once
async fn collect_names(store: &dyn ObjectStore, filter: ListFilter) -> Result<Vec<String>, StoreError> {
    let mut seen = HashSet::new();
    store
        .list(filter)
        .await?
        .try_filter(|entry| futures::future::ready(seen.insert(entry.name.clone())))
        .map_ok(|entry| entry.name)
        .try_collect()
        .await
}

/// `GET /download?filename=<name>`
#[instrument(skip(state))]
pub async fn download(State(state): State<AppState>, Query(query): Query<DownloadQuery>) -> Response {
    let filename = match query.filename {
        Some(filename) if !filename.is_empty() => filename,
        _ => return (StatusCode::BAD_REQUEST, "Filename is required").into_response(),
    };

    let reader = match state.store.begin_read(&filename).await {
        Ok(reader) => reader,
        Err(e) => {
            error!(filename = %filename, error = %e, "Failed to open stored object");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error opening file").into_response();
        }
    };

    info!(filename = %filename, "Serving download");
    counter!("filedrop_downloads_total").increment(1);

    let headers = [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        ),
        (header::CONTENT_DISPOSITION, content_disposition(&filename)),
    ];

    (headers, Body::from_stream(ReaderStream::new(reader))).into_response()
}

/// `attachment` disposition with an ASCII fallback and the exact UTF-8 name
fn content_disposition(filename: &str) -> HeaderValue {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();

    let value = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(filename)
    );

    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}
