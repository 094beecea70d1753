//! Attachment files on disk
//!
//! Files live under `{root}/{account with '@' and '.' replaced by '_'}/{timestamp_ms}_{tag}_{name}`,
//! where `tag` is random so equally named parts of one message never share a path.
//! Removal is best-effort: a file that cannot be deleted is logged and left behind.

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::parse::ParsedAttachment;
use crate::error::Result;
use crate::store::{now_ms, Attachment, NewAttachment};

#[derive(Debug, Clone)]
pub struct AttachmentStore {
    root: PathBuf,
}

/// Reduce a file name to `[A-Za-z0-9._-]`, never empty and never hidden
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned.to_string()
    }
}

impl AttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn account_dir(&self, account: &str) -> PathBuf {
        self.root.join(account.to_lowercase().replace(['@', '.'], "_"))
    }

    /// Write one attachment for `account`, returning the row to insert.
    pub async fn save(&self, account: &str, attachment: &ParsedAttachment) -> Result<NewAttachment> {
        let dir = self.account_dir(account);
        tokio::fs::create_dir_all(&dir).await?;

        let name = sanitize_filename(&attachment.name);
        let tag = Uuid::new_v4().simple().to_string();
        let path = dir.join(format!("{}_{}_{}", now_ms(), &tag[..8], name));

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(&attachment.content).await?;
        file.flush().await?;
        debug!("Saved attachment {}", path.display());

        Ok(NewAttachment {
            name: attachment.name.clone(),
            size: attachment.content.len() as i64,
            mime_type: attachment.mime_type.clone(),
            path: path.to_string_lossy().into_owned(),
        })
    }

    /// Best-effort removal of attachment files
    pub async fn remove_files(&self, paths: Vec<String>) {
        for path in paths {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove attachment {}: {}", path, e);
            }
        }
    }

    pub async fn remove(&self, attachments: &[Attachment]) {
        self.remove_files(attachments.iter().map(|a| a.path.clone()).collect())
            .await;
    }

    /// Drop the whole directory of `account`
    pub async fn remove_account(&self, account: &str) {
        let dir = self.account_dir(account);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("Removed attachment directory {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", dir.display(), e),
        }
    }

    /// Whether `path` lies under the store's root, for serving downloads
    pub fn contains(&self, path: &Path) -> bool {
        match (path.canonicalize(), self.root.canonicalize()) {
            (Ok(path), Ok(root)) => path.starts_with(root),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn attachment(name: &str) -> ParsedAttachment {
        ParsedAttachment {
            name: name.to_string(),
            mime_type: "text/plain".to_string(),
            content: b"hello".to_vec(),
        }
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report 2024.pdf"), "report_2024.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("..\\evil.exe"), "evil.exe");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename(""), "attachment");
    }

    #[test]
    fn test_account_dir() {
        let store = AttachmentStore::new("/data/attachments");
        assert_eq!(
            store.account_dir("Swift42@Example.com"),
            PathBuf::from("/data/attachments/swift42_example_com")
        );
    }

    #[tokio::test]
    async fn test_save_and_remove() {
        let dir = TempDir::new().unwrap();
        let store = AttachmentStore::new(dir.path());

        let saved = store
            .save("a@example.com", &attachment("notes.txt"))
            .await
            .unwrap();

        assert_eq!(saved.name, "notes.txt");
        assert_eq!(saved.size, 5);
        let path = PathBuf::from(&saved.path);
        assert!(path.starts_with(dir.path().join("a_example_com")));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("_notes.txt"));
        assert!(store.contains(&path));

        store.remove_files(vec![saved.path.clone()]).await;
        assert!(!path.exists());

        // Missing files are tolerated
        store.remove_files(vec![saved.path.clone()]).await;
    }

    #[tokio::test]
    async fn test_same_name_parts_get_distinct_files() {
        let dir = TempDir::new().unwrap();
        let store = AttachmentStore::new(dir.path());

        let mut first = attachment("a.txt");
        first.content = b"FIRST".to_vec();
        let mut second = attachment("a.txt");
        second.content = b"SECOND".to_vec();

        let saved_first = store.save("x@example.com", &first).await.unwrap();
        let saved_second = store.save("x@example.com", &second).await.unwrap();

        assert_ne!(saved_first.path, saved_second.path);
        assert_eq!(std::fs::read(&saved_first.path).unwrap(), b"FIRST");
        assert_eq!(std::fs::read(&saved_second.path).unwrap(), b"SECOND");
    }

    #[tokio::test]
    async fn test_remove_account() {
        let dir = TempDir::new().unwrap();
        let store = AttachmentStore::new(dir.path());
        store
            .save("a@example.com", &attachment("x.txt"))
            .await
            .unwrap();

        store.remove_account("a@example.com").await;
        assert!(!store.account_dir("a@example.com").exists());
        store.remove_account("a@example.com").await;
    }
}
