use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::parser::parse_markdown;

/// Raw text plus the identifier it is ingested under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub text: String,
}

fn inline_space() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[ \t\r\f\v]+").unwrap())
}

fn blank_lines() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\n\s*\n").unwrap())
}

/// Collapse runs of spaces and blank lines while keeping paragraph breaks
pub fn clean_text(text: &str) -> String {
    let spaced = inline_space().replace_all(text, " ");
    let lines: Vec<&str> = spaced.lines().map(str::trim).collect();
    blank_lines()
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}

fn is_markdown(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_lowercase).as_deref(),
        Some("md") | Some("markdown")
    )
}

fn is_supported_file(path: &Path) -> bool {
    is_markdown(path)
        || path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("txt"))
}

/// Read one file, rendering markdown to plain text
pub fn load_document(path: &Path) -> Result<Document> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let text = if is_markdown(path) {
        parse_markdown(&raw)
    } else {
        raw
    };

    debug!(path = %path.display(), bytes = text.len(), "Loaded document");
    Ok(Document {
        id: path.display().to_string(),
        text: clean_text(&text),
    })
}

/// A file or a directory of `.md`/`.txt` files on the local disk
pub struct LocalSource {
    path: PathBuf,
}

impl LocalSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_owned(),
        }
    }

    /// Load every document under the path, in file-name order.
    ///
    /// A file named directly is loaded whatever its extension; inside a
    /// directory only supported files are picked up.
    pub fn collect(&self) -> Result<Vec<Document>> {
        if self.path.is_file() {
            return Ok(vec![load_document(&self.path)?]);
        }
        if !self.path.is_dir() {
            return Err(anyhow!("No such file or directory: {}", self.path.display()));
        }

        let mut documents = Vec::new();
        for entry in WalkDir::new(&self.path)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() && is_supported_file(entry.path()) {
                documents.push(load_document(entry.path())?);
            }
        }

        info!(path = %self.path.display(), documents = documents.len(), "Collected documents");
        Ok(documents)
    }
}

/// Load documents from several paths, keeping the given order
pub fn collect_documents<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    for path in paths {
        documents.extend(LocalSource::new(path).collect()?);
    }
    Ok(documents)
}
