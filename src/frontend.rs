//! 上传页面模板渲染（askama，按 `.html` 扩展名自动转义）。

use askama::Template;
use axum::response::Html;

use crate::error::ApiError;

/// 上传表单：可选的提示消息与已上传文件的下载链接列表。
#[derive(Template)]
#[template(path = "upload_form.html")]
struct UploadFormTemplate {
    message: Option<String>,
    files: Vec<String>,
}

/// 渲染上传表单页面。
pub fn render_upload_form(
    message: Option<String>,
    files: Vec<String>,
) -> Result<Html<String>, ApiError> {
    UploadFormTemplate { message, files }
        .render()
        .map(Html)
        .map_err(|err| ApiError::Internal(format!("failed to render upload form: {err}")))
}
