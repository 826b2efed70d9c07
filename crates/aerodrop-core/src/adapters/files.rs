//! File sources offered to peers.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::application::ports::FileSource;
use crate::domain::peering::FileMetadata;

const FALLBACK_MIME: &str = "application/octet-stream";

/// Best-effort MIME type from a file name's extension.
pub fn mime_type_for(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("txt") => "text/plain",
        Some("html" | "htm") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        _ => FALLBACK_MIME,
    }
}

// ---------------------------------------------------------------------------
// In memory
// ---------------------------------------------------------------------------

pub struct MemoryFile {
    metadata: FileMetadata,
    data: Bytes,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            metadata: FileMetadata {
                mime_type: mime_type.into(),
                name: name.into(),
                size: data.len() as u64,
            },
            data,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }
}

#[async_trait]
impl FileSource for MemoryFile {
    fn metadata(&self) -> FileMetadata {
        self.metadata.clone()
    }

    async fn read_chunk(&self, offset: u64, len: usize) -> anyhow::Result<Bytes> {
        let start = usize::try_from(offset)?.min(self.data.len());
        let end = start.saturating_add(len).min(self.data.len());
        Ok(self.data.slice(start..end))
    }
}

// ---------------------------------------------------------------------------
// On disk
// ---------------------------------------------------------------------------

/// A file read on demand, one chunk at a time.
pub struct DiskFile {
    path: PathBuf,
    metadata: FileMetadata,
}

impl DiskFile {
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stat = tokio::fs::metadata(&path).await?;
        if !stat.is_file() {
            anyhow::bail!("{} is not a regular file", path.display());
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_owned());
        Ok(Self {
            metadata: FileMetadata {
                mime_type: mime_type_for(&name).to_owned(),
                name,
                size: stat.len(),
            },
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FileSource for DiskFile {
    fn metadata(&self) -> FileMetadata {
        self.metadata.clone()
    }

    async fn read_chunk(&self, offset: u64, len: usize) -> anyhow::Result<Bytes> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = BytesMut::zeroed(len);
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf.freeze())
    }
}
