use std::io;
use std::path::{Path, PathBuf};

/// Local directory for downloaded backend files and generated media.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub async fn write(&self, file_name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(sanitize_file_name(file_name));
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// `<prefix>_<utc timestamp>.<ext>`
    pub fn timestamped_name(prefix: &str, ext: &str) -> String {
        format!(
            "{prefix}_{}.{ext}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S%3f")
        )
    }
}

pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}
