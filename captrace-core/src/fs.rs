use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::io::AsyncReadExt;

/// Minimal, async-capable filesystem abstraction used by discovery and the
/// ledger. Real scans go through [`TokioFs`]; scanner tests use
/// [`MemoryFs`].
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Check whether a path exists.
    async fn path_exists(&self, path: &Path) -> bool;

    /// Open a directory for iteration.
    async fn read_dir(&self, path: &Path) -> Result<Box<dyn ReadDirStream + Send>, String>;

    /// Fetch lightweight file metadata.
    async fn metadata(&self, path: &Path) -> Result<FsMetadata, String>;

    /// Read the whole file into memory (parsers work on byte buffers).
    async fn read(&self, path: &Path) -> Result<Vec<u8>, String>;

    /// Streaming SHA-256 of the file contents, as a lowercase hex digest.
    async fn sha256(&self, path: &Path) -> Result<String, String>;
}

/// Lightweight metadata needed by discovery.
#[derive(Debug, Clone, Copy)]
pub struct FsMetadata {
    pub is_dir: bool,
    pub is_file: bool,
    pub len: u64,
    /// Last modified time if available
    pub modified: Option<SystemTime>,
}

/// Async directory iterator (similar to tokio::fs::ReadDir).
#[async_trait]
pub trait ReadDirStream {
    /// Return next entry's path, or None when exhausted.
    async fn next_entry(&mut self) -> Result<Option<PathBuf>, String>;
}

/// Real filesystem implementation backed by tokio::fs.
#[derive(Debug, Default, Clone)]
pub struct TokioFs;

impl TokioFs {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for TokioFs {
    async fn path_exists(&self, path: &Path) -> bool {
        // try_exists avoids errors for permission issues by returning false
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn read_dir(&self, path: &Path) -> Result<Box<dyn ReadDirStream + Send>, String> {
        let rd = tokio::fs::read_dir(path)
            .await
            .map_err(|e| format!("read_dir failed for {:?}: {}", path, e))?;
        Ok(Box::new(TokioReadDir { inner: rd }))
    }

    async fn metadata(&self, path: &Path) -> Result<FsMetadata, String> {
        let md = tokio::fs::metadata(path)
            .await
            .map_err(|e| format!("metadata failed for {:?}: {}", path, e))?;
        Ok(FsMetadata {
            is_dir: md.is_dir(),
            is_file: md.is_file(),
            len: md.len(),
            modified: md.modified().ok(),
        })
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, String> {
        tokio::fs::read(path)
            .await
            .map_err(|e| format!("read failed for {:?}: {}", path, e))
    }

    async fn sha256(&self, path: &Path) -> Result<String, String> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| format!("open failed for {:?}: {}", path, e))?;
        let mut reader = tokio::io::BufReader::new(file);
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| format!("read failed for {:?}: {}", path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

struct TokioReadDir {
    inner: tokio::fs::ReadDir,
}

#[async_trait]
impl ReadDirStream for TokioReadDir {
    async fn next_entry(&mut self) -> Result<Option<PathBuf>, String> {
        match self.inner.next_entry().await {
            Ok(Some(entry)) => Ok(Some(entry.path())),
            Ok(None) => Ok(None),
            Err(e) => Err(format!("next_entry failed: {}", e)),
        }
    }
}

/// In-memory filesystem for tests.
/// Note: Paths are treated literally; callers should use consistent absolute
/// paths.
#[derive(Default, Clone)]
pub struct MemoryFs {
    nodes: Arc<Mutex<HashMap<PathBuf, Node>>>,
}

impl std::fmt::Debug for MemoryFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.nodes.lock().map(|n| n.len()).unwrap_or(0);
        f.debug_struct("MemoryFs").field("node_count", &count).finish()
    }
}

#[derive(Clone)]
enum Node {
    Dir { children: Vec<PathBuf> },
    File { data: Vec<u8>, mtime: SystemTime },
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir<P: Into<PathBuf>>(&self, path: P) {
        let path = path.into();
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(&path) {
            return;
        }
        Self::ensure_parent_link(&mut nodes, &path);
        nodes.insert(path, Node::Dir { children: Vec::new() });
    }

    pub fn add_file<P: Into<PathBuf>>(&self, path: P, data: impl Into<Vec<u8>>) {
        let path = path.into();
        let mut nodes = self.nodes.lock().unwrap();
        Self::ensure_parent_link(&mut nodes, &path);
        nodes.insert(
            path,
            Node::File {
                data: data.into(),
                mtime: SystemTime::now(),
            },
        );
    }

    /// Overwrite a file's contents, bumping its mtime.
    pub fn touch<P: Into<PathBuf>>(&self, path: P, data: impl Into<Vec<u8>>) {
        self.add_file(path, data);
    }

    fn ensure_parent_link(nodes: &mut HashMap<PathBuf, Node>, path: &Path) {
        if let Some(parent) = path.parent() {
            let parent = parent.to_path_buf();
            match nodes.get_mut(&parent) {
                Some(Node::Dir { children }) => {
                    if !children.contains(&path.to_path_buf()) {
                        children.push(path.to_path_buf());
                    }
                }
                Some(Node::File { .. }) => {}
                None => {
                    Self::ensure_parent_link(nodes, &parent);
                    nodes.insert(
                        parent.clone(),
                        Node::Dir {
                            children: vec![path.to_path_buf()],
                        },
                    );
                }
            }
        }
    }
}

#[async_trait]
impl FileSystem for MemoryFs {
    async fn path_exists(&self, path: &Path) -> bool {
        self.nodes.lock().unwrap().contains_key(path)
    }

    async fn read_dir(&self, path: &Path) -> Result<Box<dyn ReadDirStream + Send>, String> {
        let nodes = self.nodes.lock().unwrap();
        match nodes.get(path) {
            Some(Node::Dir { children }) => Ok(Box::new(MemoryReadDir {
                entries: children.clone().into_iter().collect(),
            })),
            Some(Node::File { .. }) => Err(format!("{:?} is a file", path)),
            None => Err(format!("{:?} not found", path)),
        }
    }

    async fn metadata(&self, path: &Path) -> Result<FsMetadata, String> {
        let nodes = self.nodes.lock().unwrap();
        match nodes.get(path) {
            Some(Node::Dir { .. }) => Ok(FsMetadata {
                is_dir: true,
                is_file: false,
                len: 0,
                modified: None,
            }),
            Some(Node::File { data, mtime }) => Ok(FsMetadata {
                is_dir: false,
                is_file: true,
                len: data.len() as u64,
                modified: Some(*mtime),
            }),
            None => Err(format!("{:?} not found", path)),
        }
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, String> {
        let nodes = self.nodes.lock().unwrap();
        match nodes.get(path) {
            Some(Node::File { data, .. }) => Ok(data.clone()),
            _ => Err(format!("{:?} not found", path)),
        }
    }

    async fn sha256(&self, path: &Path) -> Result<String, String> {
        let data = self.read(path).await?;
        let mut hasher = Sha256::new();
        hasher.update(&data);
        Ok(hex::encode(hasher.finalize()))
    }
}

struct MemoryReadDir {
    entries: std::collections::VecDeque<PathBuf>,
}

#[async_trait]
impl ReadDirStream for MemoryReadDir {
    async fn next_entry(&mut self) -> Result<Option<PathBuf>, String> {
        Ok(self.entries.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_fs_links_parents() {
        let fs = MemoryFs::new();
        fs.add_file("/root/a/b/file.pdf", b"hello".to_vec());
        assert!(fs.path_exists(Path::new("/root/a/b")).await);
        assert!(fs.path_exists(Path::new("/root/a/b/file.pdf")).await);
        let md = fs.metadata(Path::new("/root/a/b/file.pdf")).await.unwrap();
        assert!(md.is_file);
        assert_eq!(md.len, 5);
    }

    #[tokio::test]
    async fn memory_fs_hash_matches_real_digest() {
        let fs = MemoryFs::new();
        fs.add_file("/f.csv", b"abc".to_vec());
        let digest = fs.sha256(Path::new("/f.csv")).await.unwrap();
        // sha256("abc")
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn tokio_fs_streams_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        tokio::fs::write(&path, b"abc").await.unwrap();
        let digest = TokioFs::new().sha256(&path).await.unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
