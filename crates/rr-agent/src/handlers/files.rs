//! File browsing: `file_list`, `file_download`, `file_preview`
//!
//! A file can be addressed by its full `path`, or by `dir` and `index` into
//! the most recent listing of that folder. Listings are remembered for a
//! minute.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use rr_core::config::FileLimits;
use rr_core::TtlCache;
use rr_protocol::{AgentCommand, AgentResponse};

use crate::executor::{CommandHandler, HandlerError};

/// How long a listing stays addressable by index
pub const LISTING_TTL: Duration = Duration::from_secs(60);

/// Cache key of the top-level (drives or root) listing
const ROOT_KEY: &str = "";

/// One row of a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Free bytes, for drives
    pub free: Option<u64>,
    /// Capacity in bytes, for drives
    pub total: Option<u64>,
}

/// `file_list` response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListing {
    /// Listed folder; `None` for the list of drives
    pub path: Option<String>,
    pub items: Vec<FileEntry>,
}

/// State shared by the file handlers
pub struct FileContext {
    limits: FileLimits,
    listings: TtlCache<String, Arc<FileListing>>,
}

impl FileContext {
    pub fn new(limits: FileLimits) -> Arc<Self> {
        Arc::new(Self {
            limits,
            listings: TtlCache::new(LISTING_TTL),
        })
    }

    /// Target of a command: `path`, or `dir` + `index`
    fn resolve(&self, command: &AgentCommand) -> Result<Option<PathBuf>, HandlerError> {
        if let Some(path) = command.parameter("path") {
            return Ok(Some(PathBuf::from(path.trim())));
        }

        let index = match command.parameter("index") {
            Some(index) => index,
            None => return Ok(None),
        };
        let index: usize = index
            .trim()
            .parse()
            .map_err(|_| HandlerError::InvalidArgument(format!("Invalid index: {}", index)))?;

        let dir = command.parameter("dir").unwrap_or(ROOT_KEY).trim().to_string();
        let listing = self.listings.get(&dir).ok_or_else(|| {
            HandlerError::InvalidArgument("Listing expired, list the folder again".to_string())
        })?;
        let entry = listing.items.get(index).ok_or_else(|| {
            HandlerError::InvalidArgument(format!("No entry {} in the listing", index))
        })?;

        Ok(Some(match &listing.path {
            Some(dir) => Path::new(dir).join(&entry.name),
            // Root listing entries are full paths already
            None => PathBuf::from(&entry.name),
        }))
    }

    fn remember(&self, listing: FileListing) -> Arc<FileListing> {
        self.listings.purge_expired();
        let key = listing.path.clone().unwrap_or_else(|| ROOT_KEY.to_string());
        let listing = Arc::new(listing);
        self.listings.insert(key, Arc::clone(&listing));
        listing
    }
}

/// `file_list`: folder contents, or drives when no folder is given
pub struct FileListHandler {
    context: Arc<FileContext>,
}

impl FileListHandler {
    pub fn new(context: Arc<FileContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl CommandHandler for FileListHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let listing = match self.context.resolve(command)? {
            Some(path) => list_directory(&path).await?,
            None => list_root().await?,
        };
        let listing = self.context.remember(listing);

        let json = serde_json::to_string(listing.as_ref())
            .map_err(|e| HandlerError::Failed(format!("Failed to encode listing: {}", e)))?;
        Ok(AgentResponse::structured(command.correlation_id.clone(), json))
    }
}

/// `file_download`: send a file as a document
pub struct FileDownloadHandler {
    context: Arc<FileContext>,
}

impl FileDownloadHandler {
    pub fn new(context: Arc<FileContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl CommandHandler for FileDownloadHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let path = self.context.resolve(command)?.ok_or_else(no_path)?;
        let metadata = file_metadata(&path).await?;

        let limit = self.context.limits.max_download_bytes;
        if metadata.len() > limit {
            return Err(HandlerError::Failed(format!(
                "File is too large ({}, limit {})",
                crate::metrics::format_bytes(metadata.len()),
                crate::metrics::format_bytes(limit)
            )));
        }

        let data = tokio::fs::read(&path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());
        tracing::info!("Sending {:?} ({} bytes)", path, data.len());
        Ok(AgentResponse::document(
            command.correlation_id.clone(),
            data,
            file_name,
        ))
    }
}

/// `file_preview`: the beginning of a text file
pub struct FilePreviewHandler {
    context: Arc<FileContext>,
}

impl FilePreviewHandler {
    pub fn new(context: Arc<FileContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl CommandHandler for FilePreviewHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let path = self.context.resolve(command)?.ok_or_else(no_path)?;
        file_metadata(&path).await?;

        let limits = &self.context.limits;
        let max_chars = limits.preview_max_chars.max(1);
        let mut file = tokio::fs::File::open(&path).await?;

        let mut probe = Vec::with_capacity(limits.binary_probe_bytes);
        (&mut file)
            .take(limits.binary_probe_bytes as u64)
            .read_to_end(&mut probe)
            .await?;
        if looks_binary(&probe) {
            return Err(HandlerError::InvalidArgument(
                "Binary file, preview not available".to_string(),
            ));
        }

        // A char is at most four UTF-8 bytes
        let wanted = (max_chars * 4) as u64;
        let mut head = probe;
        head.truncate(wanted as usize);
        if (head.len() as u64) < wanted {
            (&mut file)
                .take(wanted - head.len() as u64)
                .read_to_end(&mut head)
                .await?;
        }

        Ok(AgentResponse::text(
            command.correlation_id.clone(),
            decode_preview(&head, max_chars),
        ))
    }
}

fn no_path() -> HandlerError {
    HandlerError::InvalidArgument("No path given".to_string())
}

/// Metadata of a regular file, with folder and missing-file errors
async fn file_metadata(path: &Path) -> Result<std::fs::Metadata, HandlerError> {
    match tokio::fs::metadata(path).await {
        Ok(m) if m.is_dir() => Err(HandlerError::InvalidArgument(
            "Path is a folder".to_string(),
        )),
        Ok(m) => Ok(m),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(HandlerError::NotFound("File not found".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// A NUL byte, or more than 10% control bytes, marks a file as binary
pub fn looks_binary(probe: &[u8]) -> bool {
    if probe.is_empty() {
        return false;
    }
    let mut control = 0usize;
    for &b in probe {
        if b == 0 {
            return true;
        }
        if b < 0x09 || (b > 0x0D && b < 0x20) {
            control += 1;
        }
    }
    control * 10 > probe.len()
}

/// First `max_chars` characters of `bytes`, without a byte order mark
fn decode_preview(bytes: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.strip_prefix('\u{FEFF}').unwrap_or(&text);
    let mut preview: String = text.chars().take(max_chars).collect();
    // The read may have split the final character
    if preview.chars().count() < max_chars && preview.ends_with('\u{FFFD}') {
        preview.pop();
    }
    preview
}

async fn list_directory(path: &Path) -> Result<FileListing, HandlerError> {
    match tokio::fs::metadata(path).await {
        Ok(m) if m.is_dir() => {}
        Ok(_) => {
            return Err(HandlerError::InvalidArgument(
                "Path is not a folder".to_string(),
            ))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(HandlerError::NotFound("Folder not found".to_string()))
        }
        Err(e) => return Err(e.into()),
    }

    let mut items = Vec::new();
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        // Follow links, but still list a dangling one
        let metadata = match tokio::fs::metadata(entry.path()).await {
            Ok(m) => m,
            Err(_) => match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!("Skipping {:?}: {}", entry.path(), e);
                    continue;
                }
            },
        };

        items.push(FileEntry {
            name: entry.file_name().to_string_lossy().to_string(),
            is_directory: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            free: None,
            total: None,
        });
    }

    items.sort_by(|a, b| {
        b.is_directory
            .cmp(&a.is_directory)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });

    Ok(FileListing {
        path: Some(path.to_string_lossy().to_string()),
        items,
    })
}

#[cfg(windows)]
async fn list_root() -> Result<FileListing, HandlerError> {
    let drives = tokio::task::spawn_blocking(crate::metrics::drives)
        .await
        .map_err(|e| HandlerError::Failed(format!("Drive probe failed: {}", e)))?;

    let items = drives
        .into_iter()
        .map(|d| FileEntry {
            name: d.mount_point,
            is_directory: true,
            size: 0,
            modified: None,
            free: Some(d.available),
            total: Some(d.total),
        })
        .collect();
    Ok(FileListing { path: None, items })
}

#[cfg(not(windows))]
async fn list_root() -> Result<FileListing, HandlerError> {
    list_directory(Path::new("/")).await
}
