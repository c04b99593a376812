//! Caller-side description of one transfer

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out transfer ids, monotonically, for the lifetime of its owner.
#[derive(Debug, Default)]
pub struct IdAllocator(AtomicU64);

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Clone, Debug)]
pub struct TransferMetadata {
    id: u64,
    url: String,
    pub target_directory: Option<PathBuf>,
    pub file_name: Option<String>,
    /// `None` until the header arrives (or when the server does not know it)
    pub length: Option<u64>,
}

impl TransferMetadata {
    pub fn new(ids: &IdAllocator, url: impl Into<String>) -> Self {
        Self {
            id: ids.next(),
            url: url.into(),
            target_directory: None,
            file_name: None,
            length: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn with_target_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.target_directory = Some(dir.into());
        self
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn has_file_name(&self) -> bool {
        self.file_name.as_deref().is_some_and(|n| !n.trim().is_empty())
    }

    pub fn has_target_directory(&self) -> bool {
        self.target_directory
            .as_deref()
            .is_some_and(|d| !d.as_os_str().to_string_lossy().trim().is_empty())
    }

    /// Both target directory and file name are non-blank.
    pub fn is_target_specified(&self) -> bool {
        self.has_target_directory() && self.has_file_name()
    }
}

impl fmt::Display for TransferMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "download #{} ({})", self.id, self.url)?;
        match (&self.target_directory, &self.file_name) {
            (Some(dir), Some(name)) => write!(f, " -> {}", dir.join(name).display()),
            (None, Some(name)) => write!(f, " -> {}", name),
            _ => Ok(()),
        }
    }
}
