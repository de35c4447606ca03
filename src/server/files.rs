//! Per-session sandboxed file access.
//!
//! Every operation resolves its path against `<base>/sessions/<id>/` and
//! refuses any resolution that escapes that root, lexically (`..`) or via
//! symlinks. Failures surface to the wire as `FILE_ERROR`.

use crate::protocol::{FileContent, FileEntry, FileKind, FileList};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Read cap: 5 MiB.
pub const MAX_READ_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("path traversal denied")]
    Traversal,

    #[error("File too large")]
    TooLarge,

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("{0}")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for FileError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Sandboxed file operations rooted at the per-session directories.
pub struct FileHandler {
    base: PathBuf,
}

impl FileHandler {
    /// `base` is the directory holding one sandbox per session id.
    #[must_use]
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    /// Resolve `rel` inside the session sandbox, rejecting anything that
    /// normalizes outside it. The returned path may not exist yet.
    fn resolve(&self, session_id: &str, rel: &str) -> Result<(PathBuf, PathBuf), FileError> {
        let root = self.base.join(session_id);

        // Leading separators are treated as sandbox-relative.
        let rel = rel.trim_start_matches('/');

        let mut normalized = PathBuf::new();
        for component in Path::new(rel).components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(FileError::Traversal);
                    }
                }
                Component::RootDir | Component::Prefix(_) => {}
            }
        }

        Ok((root.clone(), root.join(normalized)))
    }

    /// Canonicalize an existing path and verify it is still under the
    /// canonical root (closes the symlink escape).
    fn confine(root: &Path, path: &Path) -> Result<PathBuf, FileError> {
        let canonical_root = root.canonicalize()?;
        let canonical = path.canonicalize()?;
        if !canonical.starts_with(&canonical_root) {
            return Err(FileError::Traversal);
        }
        Ok(canonical)
    }

    /// List a sandbox directory: dotfiles skipped, directories first, then
    /// alphabetical within each kind.
    pub async fn list_files(&self, session_id: &str, rel: &str) -> Result<FileList, FileError> {
        let (root, path) = self.resolve(session_id, rel)?;
        let dir = Self::confine(&root, &path)?;
        if !dir.is_dir() {
            return Err(FileError::NotADirectory(rel.to_string()));
        }

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata().await?;
            files.push(FileEntry {
                name,
                kind: if meta.is_dir() {
                    FileKind::Directory
                } else {
                    FileKind::File
                },
                size: meta.len(),
            });
        }

        files.sort_by(|a, b| {
            let rank = |kind: FileKind| match kind {
                FileKind::Directory => 0,
                FileKind::File => 1,
            };
            rank(a.kind).cmp(&rank(b.kind)).then(a.name.cmp(&b.name))
        });

        Ok(FileList {
            path: rel.to_string(),
            files,
        })
    }

    /// Read a sandboxed file, capped at [`MAX_READ_BYTES`].
    pub async fn read_file(&self, session_id: &str, rel: &str) -> Result<FileContent, FileError> {
        let (root, path) = self.resolve(session_id, rel)?;
        let file = Self::confine(&root, &path)?;

        let meta = tokio::fs::metadata(&file).await?;
        if meta.len() > MAX_READ_BYTES {
            return Err(FileError::TooLarge);
        }

        let bytes = tokio::fs::read(&file).await?;
        Ok(FileContent {
            path: rel.to_string(),
            content: String::from_utf8_lossy(&bytes).into_owned(),
            language: language_for_path(&file).to_string(),
        })
    }

    /// Write UTF-8 content to a sandboxed file, creating parent directories
    /// as needed. Overwrites.
    pub async fn write_file(
        &self,
        session_id: &str,
        rel: &str,
        content: &str,
    ) -> Result<(), FileError> {
        let (root, path) = self.resolve(session_id, rel)?;

        let parent = path.parent().ok_or(FileError::Traversal)?;
        tokio::fs::create_dir_all(parent).await?;

        // The parent exists now; confirm the final location is confined
        // before touching the file itself.
        let canonical_parent = Self::confine(&root, parent)?;
        let file_name = path.file_name().ok_or(FileError::Traversal)?;
        tokio::fs::write(canonical_parent.join(file_name), content).await?;
        Ok(())
    }
}

/// Syntax-highlighting tag for a path, from a fixed extension table.
fn language_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "md" | "markdown" => "markdown",
        "py" => "python",
        "rs" => "rust",
        "go" => "go",
        "json" => "json",
        "html" | "htm" => "html",
        "css" => "css",
        "sh" | "bash" | "zsh" => "shell",
        "yml" | "yaml" => "yaml",
        "toml" => "toml",
        "sql" => "sql",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "java" => "java",
        "rb" => "ruby",
        _ => "plaintext",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> (tempfile::TempDir, FileHandler) {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("sessions");
        tokio::fs::create_dir_all(base.join("ab12cd34/src"))
            .await
            .unwrap();
        tokio::fs::write(base.join("ab12cd34/readme.md"), "# hi\n")
            .await
            .unwrap();
        tokio::fs::write(base.join("ab12cd34/.hidden"), "secret")
            .await
            .unwrap();
        tokio::fs::write(base.join("ab12cd34/src/main.rs"), "fn main() {}\n")
            .await
            .unwrap();
        (dir, FileHandler::new(base))
    }

    #[tokio::test]
    async fn test_list_skips_dotfiles_dirs_first() {
        let (_dir, handler) = fixture().await;
        let listing = handler.list_files("ab12cd34", ".").await.unwrap();
        let names: Vec<&str> = listing.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["src", "readme.md"]);
        assert_eq!(listing.files[0].kind, FileKind::Directory);
        assert_eq!(listing.files[1].kind, FileKind::File);
    }

    #[tokio::test]
    async fn test_read_with_language() {
        let (_dir, handler) = fixture().await;
        let content = handler.read_file("ab12cd34", "src/main.rs").await.unwrap();
        assert_eq!(content.content, "fn main() {}\n");
        assert_eq!(content.language, "rust");

        let md = handler.read_file("ab12cd34", "readme.md").await.unwrap();
        assert_eq!(md.language, "markdown");
    }

    #[tokio::test]
    async fn test_write_creates_parents_and_overwrites() {
        let (_dir, handler) = fixture().await;
        handler
            .write_file("ab12cd34", "notes/today.txt", "first")
            .await
            .unwrap();
        handler
            .write_file("ab12cd34", "notes/today.txt", "second")
            .await
            .unwrap();
        let read = handler.read_file("ab12cd34", "notes/today.txt").await.unwrap();
        assert_eq!(read.content, "second");
        assert_eq!(read.language, "plaintext");
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let (_dir, handler) = fixture().await;
        for path in ["../../etc/passwd", "../other", "src/../../escape", ".."] {
            assert!(
                matches!(
                    handler.read_file("ab12cd34", path).await,
                    Err(FileError::Traversal)
                ),
                "read should reject {path}"
            );
            assert!(
                matches!(
                    handler.write_file("ab12cd34", path, "x").await,
                    Err(FileError::Traversal)
                ),
                "write should reject {path}"
            );
        }
        assert!(matches!(
            handler.list_files("ab12cd34", "../..").await,
            Err(FileError::Traversal)
        ));
    }

    #[tokio::test]
    async fn test_symlink_escape_rejected() {
        let (dir, handler) = fixture().await;
        let outside = dir.path().join("outside.txt");
        tokio::fs::write(&outside, "outside").await.unwrap();
        tokio::fs::symlink(&outside, dir.path().join("sessions/ab12cd34/link.txt"))
            .await
            .unwrap();
        assert!(matches!(
            handler.read_file("ab12cd34", "link.txt").await,
            Err(FileError::Traversal)
        ));
    }

    #[tokio::test]
    async fn test_read_cap() {
        let (dir, handler) = fixture().await;
        let big = dir.path().join("sessions/ab12cd34/big.bin");
        let file = std::fs::File::create(&big).unwrap();
        file.set_len(MAX_READ_BYTES + 1).unwrap();
        assert!(matches!(
            handler.read_file("ab12cd34", "big.bin").await,
            Err(FileError::TooLarge)
        ));
    }

    #[tokio::test]
    async fn test_absolute_path_treated_as_relative() {
        let (_dir, handler) = fixture().await;
        let content = handler.read_file("ab12cd34", "/readme.md").await.unwrap();
        assert_eq!(content.content, "# hi\n");
    }
}
