//! Media-host collaborator: pushes a local file to the host and hands back the
//! public URL.
//!
//! The trait is blocking on purpose; handlers call it from `spawn_blocking`,
//! the same way database work is moved off the async runtime.

use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use sha1::{Digest, Sha1};
use thiserror::Error;
use uuid::Uuid;

use crate::config::CloudinarySettings;

const CLOUDINARY_API_BASE: &str = "https://api.cloudinary.com/v1_1";
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Image,
}

impl MediaKind {
    /// Cloudinary resource type segment.
    pub fn resource_type(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Image => "image",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource_type())
    }
}

/// A file the host accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedMedia {
    pub url: String,
    pub public_id: String,
    pub kind: MediaKind,
    /// Seconds, reported for video uploads only.
    pub duration: Option<f64>,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("error while uploading {kind}: could not read local file")]
    LocalFile {
        kind: MediaKind,
        #[source]
        source: std::io::Error,
    },
    #[error("error while uploading {kind}: media host returned {status}")]
    Rejected {
        kind: MediaKind,
        status: u16,
        detail: String,
    },
    #[error("error while uploading {kind}: media host unreachable")]
    Transport { kind: MediaKind, detail: String },
    #[error("error while uploading {kind}: unexpected media host response")]
    BadResponse { kind: MediaKind, detail: String },
}

pub trait MediaUploader: Send + Sync {
    fn upload(&self, path: &Path, kind: MediaKind) -> Result<UploadedMedia, UploadError>;

    /// Removes a previously uploaded asset.
    fn destroy(&self, media: &UploadedMedia) -> Result<(), UploadError>;
}

#[derive(Debug, Deserialize)]
struct CloudinaryUploadResponse {
    public_id: String,
    #[serde(default)]
    secure_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
}

/// Signed-upload client for the Cloudinary REST API.
pub struct CloudinaryUploader {
    settings: CloudinarySettings,
    agent: ureq::Agent,
    api_base: String,
}

impl CloudinaryUploader {
    pub fn new(settings: CloudinarySettings) -> Self {
        Self::with_api_base(settings, CLOUDINARY_API_BASE)
    }

    pub fn with_api_base(settings: CloudinarySettings, api_base: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(UPLOAD_TIMEOUT).build();
        Self {
            settings,
            agent,
            api_base: api_base.into(),
        }
    }

    fn endpoint(&self, kind: MediaKind, action: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.api_base.trim_end_matches('/'),
            self.settings.cloud_name,
            kind.resource_type(),
            action
        )
    }

    /// Adds `timestamp`, `api_key` and `signature` to the parameters that
    /// must be signed.
    fn signed_fields(&self, mut params: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
        params.push(("timestamp", chrono::Utc::now().timestamp().to_string()));
        let signature = sign_params(&params, &self.settings.api_secret);
        params.push(("api_key", self.settings.api_key.clone()));
        params.push(("signature", signature));
        params
    }

    fn check(
        kind: MediaKind,
        outcome: Result<ureq::Response, ureq::Error>,
    ) -> Result<ureq::Response, UploadError> {
        match outcome {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(status, response)) => Err(UploadError::Rejected {
                kind,
                status,
                detail: response.into_string().unwrap_or_default(),
            }),
            Err(err) => Err(UploadError::Transport {
                kind,
                detail: err.to_string(),
            }),
        }
    }
}

impl MediaUploader for CloudinaryUploader {
    fn upload(&self, path: &Path, kind: MediaKind) -> Result<UploadedMedia, UploadError> {
        let local = |source| UploadError::LocalFile { kind, source };
        let file = File::open(path).map_err(local)?;
        let size = file.metadata().map_err(local)?.len();
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("upload");

        let mut params = Vec::new();
        if let Some(folder) = &self.settings.folder {
            params.push(("folder", folder.clone()));
        }
        let form = StreamingForm::new(&self.signed_fields(params), file_name, mime.essence_str(), size);

        tracing::debug!(path = %path.display(), %kind, size, "uploading to media host");
        let request = self
            .agent
            .post(&self.endpoint(kind, "upload"))
            .set("Content-Type", &form.content_type())
            .set("Content-Length", &form.content_length().to_string());
        let response = Self::check(kind, request.send(form.into_reader(file)))?;
        let body: CloudinaryUploadResponse =
            response
                .into_json()
                .map_err(|err| UploadError::BadResponse {
                    kind,
                    detail: err.to_string(),
                })?;

        let url = body
            .secure_url
            .or(body.url)
            .ok_or_else(|| UploadError::BadResponse {
                kind,
                detail: "response carried no URL".to_string(),
            })?;

        Ok(UploadedMedia {
            url,
            public_id: body.public_id,
            kind,
            duration: body.duration,
        })
    }

    fn destroy(&self, media: &UploadedMedia) -> Result<(), UploadError> {
        let fields = self.signed_fields(vec![("public_id", media.public_id.clone())]);
        let form: Vec<(&str, &str)> = fields
            .iter()
            .map(|(key, value)| (*key, value.as_str()))
            .collect();
        let outcome = self
            .agent
            .post(&self.endpoint(media.kind, "destroy"))
            .send_form(&form);
        Self::check(media.kind, outcome)?;
        Ok(())
    }
}

/// `multipart/form-data` body whose file part is read from disk while the
/// request is sent, so an upload never sits in memory.
struct StreamingForm {
    boundary: String,
    head: Vec<u8>,
    tail: Vec<u8>,
    file_len: u64,
}

impl StreamingForm {
    fn new(fields: &[(&str, String)], file_name: &str, mime: &str, file_len: u64) -> Self {
        let boundary = format!("newtube-{}", Uuid::new_v4().simple());
        let mut head = Vec::new();
        for (name, value) in fields {
            head.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        let file_name = file_name.replace('"', "");
        head.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: {mime}\r\n\r\n"
            )
            .as_bytes(),
        );
        let tail = format!("\r\n--{boundary}--\r\n").into_bytes();

        Self {
            boundary,
            head,
            tail,
            file_len,
        }
    }

    fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    fn content_length(&self) -> u64 {
        self.head.len() as u64 + self.file_len + self.tail.len() as u64
    }

    /// Caps the file at the length announced in `Content-Length`.
    fn into_reader<R: Read>(self, file: R) -> impl Read {
        Cursor::new(self.head)
            .chain(file.take(self.file_len))
            .chain(Cursor::new(self.tail))
    }
}

/// Cloudinary request signature: parameters sorted by name, joined as
/// `k=v&k=v`, secret appended, SHA-1 hex digest.
fn sign_params(params: &[(&str, String)], api_secret: &str) -> String {
    let mut sorted: Vec<_> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let joined = sorted
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Sha1::new();
    hasher.update(joined.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CloudinarySettings {
        CloudinarySettings {
            cloud_name: "demo".into(),
            api_key: "1234".into(),
            api_secret: "abcd".into(),
            folder: None,
        }
    }

    #[test]
    fn signature_matches_documented_example() {
        // Example from the Cloudinary signing guide.
        let params = vec![
            ("timestamp", "1315060510".to_string()),
            ("public_id", "sample_image".to_string()),
            ("eager", "w_400,h_300,c_pad|w_260,h_200,c_crop".to_string()),
        ];
        assert_eq!(
            sign_params(&params, "abcd"),
            "bfd09f95f331f558cbd1320e67aa8d488770583e"
        );
    }

    #[test]
    fn endpoint_includes_cloud_and_resource_type() {
        let uploader = CloudinaryUploader::with_api_base(settings(), "http://localhost:9/v1_1/");
        assert_eq!(
            uploader.endpoint(MediaKind::Video, "upload"),
            "http://localhost:9/v1_1/demo/video/upload"
        );
        assert_eq!(
            uploader.endpoint(MediaKind::Image, "destroy"),
            "http://localhost:9/v1_1/demo/image/destroy"
        );
    }

    #[test]
    fn streaming_form_frames_the_file_without_buffering_it() {
        let fields = vec![("timestamp", "1".to_string())];
        let form = StreamingForm::new(&fields, "my\"clip.mp4", "video/mp4", 5);
        let expected_len = form.content_length();
        let closing = format!("\r\n--{}--\r\n", form.boundary);
        assert!(form.content_type().ends_with(&form.boundary));

        let mut body = Vec::new();
        form.into_reader(Cursor::new(b"hello world".to_vec()))
            .read_to_end(&mut body)
            .unwrap();
        let text = String::from_utf8(body).unwrap();

        assert_eq!(text.len() as u64, expected_len);
        assert!(text.contains("name=\"timestamp\"\r\n\r\n1\r\n"));
        assert!(text.contains("name=\"file\"; filename=\"myclip.mp4\"\r\nContent-Type: video/mp4"));
        assert!(text.contains("\r\n\r\nhello\r\n--"));
        assert!(!text.contains("world"));
        assert!(text.ends_with(&closing));
    }

    #[test]
    fn missing_local_file_is_reported() {
        let uploader = CloudinaryUploader::new(settings());
        let dir = tempfile::tempdir().unwrap();
        let err = uploader
            .upload(&dir.path().join("missing.mp4"), MediaKind::Video)
            .unwrap_err();
        assert!(matches!(err, UploadError::LocalFile { kind: MediaKind::Video, .. }));
        assert_eq!(
            err.to_string(),
            "error while uploading video: could not read local file"
        );
    }
}
