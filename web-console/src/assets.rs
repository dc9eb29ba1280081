use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::http::header::CACHE_CONTROL;
use axum::http::header::CONTENT_TYPE;
use axum::http::header::PRAGMA;
use axum::response::Response;
use tracing::debug;

use crate::error_response;

const INDEX_FILE: &str = "index.html";

/// Serves one file from `public_dir` for a percent-encoded request path.
pub(crate) async fn serve(public_dir: &Path, request_path: &str) -> Response {
    let Ok(request_path) = urlencoding::decode(request_path) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid path".to_string());
    };
    let Some(relative) = resolve_request_path(&request_path) else {
        return error_response(StatusCode::FORBIDDEN, "forbidden".to_string());
    };
    let path = public_dir.join(relative);
    let is_file = tokio::fs::metadata(&path)
        .await
        .is_ok_and(|metadata| metadata.is_file());
    if !is_file {
        return error_response(StatusCode::NOT_FOUND, "not found".to_string());
    }
    let body = match tokio::fs::read(&path).await {
        Ok(body) => body,
        Err(err) => {
            debug!("failed to read {}: {err}", path.display());
            return error_response(StatusCode::NOT_FOUND, "not found".to_string());
        }
    };

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let mut response = Response::new(body.into());
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    apply_no_cache(&mut response);
    response
}

/// Maps a URL path onto a relative file path. `/` names the index file;
/// anything that would climb out of the directory yields `None`.
fn resolve_request_path(request_path: &str) -> Option<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    let trimmed = if trimmed.is_empty() { INDEX_FILE } else { trimmed };
    let mut resolved = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if resolved.as_os_str().is_empty() {
        resolved.push(INDEX_FILE);
    }
    Some(resolved)
}

fn apply_no_cache(response: &mut Response) {
    response.headers_mut().insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-store, max-age=0"),
    );
    response
        .headers_mut()
        .insert(PRAGMA, HeaderValue::from_static("no-cache"));
}
