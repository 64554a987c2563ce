//! On-disk store for uploaded context documents.
//!
//! Files are kept as `<dir>/<uuid><ext>`; the original filename is not
//! persisted. Text extraction is out of scope, so only plain-text uploads get
//! a preview.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

const PREVIEW_CHARS: usize = 500;

const ALLOWED: [(&str, &[&str]); 3] = [
    (".pdf", &["application/pdf"]),
    (
        ".docx",
        &["application/vnd.openxmlformats-officedocument.wordprocessingml.document"],
    ),
    (".txt", &["text/plain"]),
];

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Invalid filename")]
    InvalidFilename,

    #[error("Unsupported file type: {0}. Allowed: .pdf, .docx, .txt")]
    UnsupportedType(String),

    #[error("Content type {content_type} does not match {ext}")]
    MimeMismatch { ext: String, content_type: String },

    #[error("File too large: {size} bytes (limit {limit} bytes)")]
    TooLarge { size: u64, limit: u64 },

    #[error("Context file not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextMetadata {
    pub context_id: String,
    pub filename: String,
    pub file_type: String,
    pub file_size: u64,
    pub text_preview: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextFileInfo {
    pub filename: String,
    pub file_size: u64,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ContextStore {
    dir: PathBuf,
    max_bytes: u64,
}

impl ContextStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Check name, extension, declared content type and size. Returns the
    /// normalized (lowercase) extension.
    pub fn check(
        &self,
        filename: &str,
        content_type: Option<&str>,
        size: u64,
    ) -> Result<String, ContextError> {
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename.contains("..")
        {
            return Err(ContextError::InvalidFilename);
        }

        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))
            .unwrap_or_default();
        let mimes = ALLOWED
            .iter()
            .find(|(e, _)| *e == ext)
            .map(|(_, m)| *m)
            .ok_or_else(|| ContextError::UnsupportedType(ext.clone()))?;

        if let Some(ct) = content_type {
            let essence = ct.split(';').next().unwrap_or_default().trim().to_lowercase();
            if !mimes.contains(&essence.as_str()) {
                return Err(ContextError::MimeMismatch {
                    ext,
                    content_type: ct.to_string(),
                });
            }
        }

        if size > self.max_bytes {
            return Err(ContextError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(ext)
    }

    pub async fn save(
        &self,
        filename: &str,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<ContextMetadata, ContextError> {
        let ext = self.check(filename, content_type, bytes.len() as u64)?;

        let id = Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.dir.join(format!("{id}{ext}")), bytes).await?;

        info!(context_id = %id, file_type = %ext, size = bytes.len(), "context file stored");

        Ok(ContextMetadata {
            text_preview: preview(&ext, bytes),
            context_id: id,
            filename: filename.to_string(),
            file_type: ext,
            file_size: bytes.len() as u64,
            uploaded_at: Utc::now(),
        })
    }

    /// Stored files, newest first. A store that was never written to is empty.
    pub async fn list(&self) -> Result<Vec<ContextFileInfo>, ContextError> {
        let mut out = Vec::new();
        let mut rd = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = rd.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let uploaded_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            out.push(ContextFileInfo {
                filename: entry.file_name().to_string_lossy().into_owned(),
                file_size: meta.len(),
                uploaded_at,
            });
        }
        out.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(out)
    }

    pub async fn delete(&self, context_id: &str) -> Result<(), ContextError> {
        // only ids this store minted; anything else cannot name a stored file
        if Uuid::parse_str(context_id).is_err() {
            return Err(ContextError::NotFound(context_id.to_string()));
        }

        for (ext, _) in ALLOWED {
            let path = self.dir.join(format!("{context_id}{ext}"));
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    info!(context_id, "context file deleted");
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ContextError::NotFound(context_id.to_string()))
    }
}

fn preview(ext: &str, bytes: &[u8]) -> String {
    if ext != ".txt" {
        return String::new();
    }
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.chars().count() > PREVIEW_CHARS {
        let cut: String = text.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}
