//! Document sources feeding the rewriter.
//!
//! A [`DocumentSource`] lists documents and fetches their Markdown text along
//! with a last-edited time, which doubles as the cache freshness marker.
//! [`MarkdownDirSource`] serves `.md`, `.markdown`, and `.mdx` files from a
//! directory tree.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, instrument};

/// File extensions served by [`MarkdownDirSource`].
const MARKDOWN_EXTENSIONS: &[&str] = &["md", "markdown", "mdx"];

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    /// Stable identifier used with [`DocumentSource::fetch`].
    pub id: String,
    pub title: String,
}

/// A fetched document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub text: String,
    pub last_edited: Option<DateTime<Utc>>,
}

/// Errors from a [`DocumentSource`].
#[derive(Debug, Error)]
pub enum SourceError {
    /// No document with this id.
    #[error("document not found: {id}")]
    NotFound { id: String },

    /// Reading the backing store failed.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SourceError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Where documents come from.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Lists available documents.
    async fn list(&self) -> Result<Vec<DocumentRef>, SourceError>;

    /// Fetches one document by id.
    async fn fetch(&self, id: &str) -> Result<Document, SourceError>;
}

/// Markdown files under a root directory. Ids are `/`-separated paths
/// relative to the root; hidden entries are skipped.
#[derive(Debug, Clone)]
pub struct MarkdownDirSource {
    root: PathBuf,
}

impl MarkdownDirSource {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, id: &str) -> Option<PathBuf> {
        let relative = Path::new(id);
        let safe = relative
            .components()
            .all(|component| matches!(component, std::path::Component::Normal(_)));
        (safe && is_markdown(relative)).then(|| self.root.join(relative))
    }

    fn relative_id(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[async_trait]
impl DocumentSource for MarkdownDirSource {
    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn list(&self) -> Result<Vec<DocumentRef>, SourceError> {
        let mut pending = vec![self.root.clone()];
        let mut documents = Vec::new();

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| SourceError::io(&dir, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| SourceError::io(&dir, e))?
            {
                let path = entry.path();
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| SourceError::io(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() && is_markdown(&path) {
                    let text = tokio::fs::read_to_string(&path)
                        .await
                        .map_err(|e| SourceError::io(&path, e))?;
                    documents.push(DocumentRef {
                        id: self.relative_id(&path),
                        title: title_of(&text, &path),
                    });
                }
            }
        }

        documents.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(count = documents.len(), "listed markdown documents");
        Ok(documents)
    }

    async fn fetch(&self, id: &str) -> Result<Document, SourceError> {
        let not_found = || SourceError::NotFound { id: id.to_string() };
        let path = self.resolve(id).ok_or_else(not_found)?;

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Err(not_found()),
            Err(error) => return Err(SourceError::io(&path, error)),
        };
        let last_edited = tokio::fs::metadata(&path)
            .await
            .and_then(|meta| meta.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        Ok(Document {
            id: id.to_string(),
            title: title_of(&text, &path),
            text,
            last_edited,
        })
    }
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            MARKDOWN_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// First level-one heading, else the file stem.
fn title_of(text: &str, path: &Path) -> String {
    text.lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|heading| heading.trim().to_string())
        .filter(|heading| !heading.is_empty())
        .unwrap_or_else(|| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
}
