//! Spools multipart request bodies to local temp files.
//!
//! The media host client uploads from a path, so every file field is
//! streamed chunk by chunk into a `NamedTempFile` under the spool directory.
//! The temp files are removed when the [`UploadForm`] is dropped.

use std::collections::HashMap;
use std::path::Path;

use axum::extract::Multipart;
use mime_guess::mime;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use crate::envelope::{ApiError, ApiResult};
use crate::media::MediaKind;

#[derive(Debug)]
pub struct SpooledFile {
    file: NamedTempFile,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub size: u64,
}

impl SpooledFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Declared content type, or the one guessed from the client file name.
    fn mime_type(&self) -> Option<mime::Mime> {
        self.content_type
            .as_deref()
            .and_then(|raw| raw.parse::<mime::Mime>().ok())
            .filter(|declared| *declared != mime::APPLICATION_OCTET_STREAM)
            .or_else(|| {
                self.file_name
                    .as_deref()
                    .and_then(|name| mime_guess::from_path(name).first())
            })
    }

    fn matches(&self, kind: MediaKind) -> bool {
        let expected = match kind {
            MediaKind::Video => mime::VIDEO,
            MediaKind::Image => mime::IMAGE,
        };
        self.mime_type()
            .is_some_and(|found| found.type_() == expected)
    }
}

#[derive(Debug, Default)]
pub struct UploadForm {
    fields: HashMap<String, String>,
    files: HashMap<String, SpooledFile>,
}

impl UploadForm {
    /// Drains the multipart stream. Repeated names keep the last value.
    pub async fn collect(mut multipart: Multipart, spool_dir: &Path) -> ApiResult<Self> {
        let mut form = UploadForm::default();

        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|err| ApiError::validation(format!("malformed multipart body: {err}")))?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };

            let Some(file_name) = field.file_name().map(str::to_string) else {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ApiError::validation(format!("invalid field {name}: {err}")))?;
                form.fields.insert(name, text);
                continue;
            };

            let content_type = field.content_type().map(str::to_string);
            let temp = spool_file(spool_dir, &file_name)?;
            let mut out = tokio::fs::File::from_std(
                temp.reopen()
                    .map_err(|err| ApiError::infrastructure("Error while receiving upload", err))?,
            );
            let mut size = 0u64;
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|err| ApiError::validation(format!("upload of {name} interrupted: {err}")))?
            {
                size += chunk.len() as u64;
                out.write_all(&chunk)
                    .await
                    .map_err(|err| ApiError::infrastructure("Error while receiving upload", err))?;
            }
            out.flush()
                .await
                .map_err(|err| ApiError::infrastructure("Error while receiving upload", err))?;

            tracing::debug!(field = %name, file = %file_name, size, "spooled upload");
            form.files.insert(
                name,
                SpooledFile {
                    file: temp,
                    file_name: Some(file_name),
                    content_type,
                    size,
                },
            );
        }

        Ok(form)
    }

    /// Trimmed text value; blank counts as missing.
    pub fn text(&self, name: &str) -> Option<String> {
        self.fields
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    /// Non-empty file field of the expected media kind.
    pub fn file(&self, name: &str, kind: MediaKind) -> ApiResult<Option<&SpooledFile>> {
        let Some(file) = self.files.get(name).filter(|file| file.size > 0) else {
            return Ok(None);
        };
        if !file.matches(kind) {
            return Err(ApiError::validation(format!("{name} must be a {kind} file")));
        }
        Ok(Some(file))
    }
}

fn spool_file(spool_dir: &Path, client_name: &str) -> ApiResult<NamedTempFile> {
    let suffix = Path::new(client_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();
    tempfile::Builder::new()
        .prefix("upload-")
        .suffix(&suffix)
        .tempfile_in(spool_dir)
        .map_err(|err| ApiError::infrastructure("Error while receiving upload", err))
}
