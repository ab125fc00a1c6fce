//! 文件列表、下载与上传处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Multipart, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri, header};
use axum::response::{Html, IntoResponse, Response};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use cookie::time::Duration as CookieDuration;
use futures_util::TryStreamExt;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::{FLASH_COOKIE_NAME, FLASH_TTL_SECS};
use crate::error::ApiError;
use crate::frontend::render_upload_form;
use crate::http::base_url;
use crate::storage::Storage;

/// 路径段中保留原样的字符之外全部编码。
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// 上传表单中文件字段的名称。
const FILE_FIELD: &str = "file";

/// 列出已上传文件的下载地址，并显示一次性的上传提示。
pub async fn list_files(
    uri: Uri,
    headers: HeaderMap,
    jar: CookieJar,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<(CookieJar, Html<String>), ApiError> {
    let mut names = storage
        .load_all()
        .await?
        .try_collect::<Vec<_>>()
        .await?;
    names.sort();

    let base = base_url(&headers, &uri);
    let urls = names
        .iter()
        .filter_map(|name| name.to_str())
        .map(|name| format!("{base}/files/{}", utf8_percent_encode(name, PATH_SEGMENT)))
        .collect::<Vec<_>>();
    info!(count = urls.len(), "list files");

    let uploaded = jar
        .get(FLASH_COOKIE_NAME)
        .map(|cookie| percent_decode_str(cookie.value()).decode_utf8_lossy().into_owned());
    let jar = match uploaded {
        Some(_) => jar.remove(Cookie::build(FLASH_COOKIE_NAME).path("/")),
        None => jar,
    };
    let message = uploaded.map(|name| format!("You successfully uploaded {name}!"));

    Ok((jar, render_upload_form(message, urls)?))
}

/// 以附件形式下载单个文件。
pub async fn serve_file(
    Path(filename): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let resource = match storage.load_as_resource(&filename).await {
        Ok(resource) => resource,
        Err(err) => {
            if err.is_not_found() {
                debug!(filename, error = %err, "download target not found");
            }
            return Err(err.into());
        }
    };
    let mime = mime_guess::from_path(resource.filename()).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid MIME type".into()))?,
    );
    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&resource.size().to_string())
            .map_err(|_| ApiError::Internal("failed to build response headers".into()))?,
    );
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(resource.filename())?,
    );

    info!(filename = resource.filename(), size = resource.size(), "download file");
    let stream = ReaderStream::new(resource.into_file());
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

/// 保存表单中的 `file` 字段，成功后重定向回列表页。
pub async fn handle_upload(
    jar: CookieJar,
    Extension(storage): Extension<Arc<Storage>>,
    mut multipart: Multipart,
) -> Result<(CookieJar, Response), ApiError> {
    let mut uploaded = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        storage.store(&filename, field).await?;
        uploaded = Some(filename);
        break;
    }

    let Some(filename) = uploaded else {
        return Err(ApiError::BadRequest(format!(
            "Required part '{FILE_FIELD}' is not present."
        )));
    };
    info!(filename, "upload file");

    let flash = Cookie::build((
        FLASH_COOKIE_NAME,
        utf8_percent_encode(&filename, PATH_SEGMENT).to_string(),
    ))
    .path("/")
    .http_only(true)
    .same_site(SameSite::Lax)
    .max_age(CookieDuration::seconds(FLASH_TTL_SECS));

    Ok((
        jar.add(flash),
        (StatusCode::FOUND, [(header::LOCATION, "/")]).into_response(),
    ))
}

/// 构建附件下载头；非 ASCII 文件名额外附带 RFC 5987 编码形式。
fn content_disposition(filename: &str) -> Result<HeaderValue, ApiError> {
    let plain = filename
        .chars()
        .all(|ch| ch.is_ascii_graphic() && ch != '"' && ch != '\\' || ch == ' ');
    let value = if plain {
        format!("attachment; filename=\"{filename}\"")
    } else {
        let fallback = filename
            .chars()
            .map(|ch| {
                if ch.is_ascii_graphic() && ch != '"' && ch != '\\' {
                    ch
                } else {
                    '_'
                }
            })
            .collect::<String>();
        format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
            utf8_percent_encode(filename, PATH_SEGMENT)
        )
    };
    HeaderValue::from_str(&value)
        .map_err(|_| ApiError::Internal("failed to build response headers".into()))
}
