//! Per-turn scratch files for inline image attachments.

use std::path::Path;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde::Serialize;
use tempfile::TempDir;
use tracing::debug;
use tracing::warn;

const IMAGE_DIR: &str = ".tmp/images";
const DEFAULT_EXTENSION: &str = "png";

/// An inline attachment encoded as a `data:<mime>;base64,<payload>` URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub data: String,
}

impl Attachment {
    pub fn from_bytes(mime_type: &str, bytes: &[u8]) -> Self {
        Self {
            data: format!("data:{mime_type};base64,{}", STANDARD.encode(bytes)),
        }
    }

    fn split(&self) -> Option<(&str, &str)> {
        let rest = self.data.strip_prefix("data:")?;
        let (mime_type, payload) = rest.split_once(";base64,")?;
        if mime_type.is_empty() || payload.is_empty() {
            return None;
        }
        Some((mime_type, payload))
    }
}

fn extension_for(mime_type: &str) -> &str {
    match mime_type.split('/').nth(1) {
        Some(subtype)
            if !subtype.is_empty() && subtype.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            subtype
        }
        _ => DEFAULT_EXTENSION,
    }
}

/// Files decoded for one turn. The directory is removed on [`release`] or,
/// failing that, when the value is dropped.
///
/// [`release`]: TempResources::release
#[derive(Debug, Default)]
pub struct TempResources {
    dir: Option<TempDir>,
    files: Vec<PathBuf>,
}

impl TempResources {
    /// [`materialize`] on the blocking pool.
    ///
    /// [`materialize`]: TempResources::materialize
    pub async fn prepare(cwd: PathBuf, attachments: Vec<Attachment>) -> Self {
        if attachments.is_empty() {
            return Self::default();
        }
        match tokio::task::spawn_blocking(move || Self::materialize(&cwd, &attachments)).await {
            Ok(resources) => resources,
            Err(err) => {
                warn!("attachment task failed: {err}");
                Self::default()
            }
        }
    }

    /// Decodes `attachments` into a fresh directory under `cwd`. Attachments
    /// that cannot be decoded or written are skipped.
    pub fn materialize(cwd: &Path, attachments: &[Attachment]) -> Self {
        if attachments.is_empty() {
            return Self::default();
        }

        let parent = cwd.join(IMAGE_DIR);
        if let Err(err) = std::fs::create_dir_all(&parent) {
            warn!("failed to create {}: {err}", parent.display());
            return Self::default();
        }
        let dir = match tempfile::Builder::new().prefix("turn-").tempdir_in(&parent) {
            Ok(dir) => dir,
            Err(err) => {
                warn!("failed to create image directory in {}: {err}", parent.display());
                return Self::default();
            }
        };

        let mut files = Vec::with_capacity(attachments.len());
        for (index, attachment) in attachments.iter().enumerate() {
            let Some((mime_type, payload)) = attachment.split() else {
                warn!(index, "skipping attachment with invalid data URL");
                continue;
            };
            let bytes = match STANDARD.decode(payload.trim()) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(index, "skipping attachment with invalid base64: {err}");
                    continue;
                }
            };
            let path = dir
                .path()
                .join(format!("image_{index}.{}", extension_for(mime_type)));
            match std::fs::write(&path, bytes) {
                Ok(()) => files.push(path),
                Err(err) => warn!("failed to write {}: {err}", path.display()),
            }
        }

        debug!(count = files.len(), dir = %dir.path().display(), "materialized attachments");
        Self {
            dir: Some(dir),
            files,
        }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn dir_path(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }

    /// Deletes every file and the directory. Errors are ignored: the files
    /// may already be gone.
    pub fn release(self) {
        for file in &self.files {
            let _ = std::fs::remove_file(file);
        }
        if let Some(dir) = self.dir {
            let path = dir.path().to_path_buf();
            if let Err(err) = dir.close() {
                debug!("ignoring cleanup failure for {}: {err}", path.display());
            }
        }
    }
}
