use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Directory listing element, serialized with the field names clients expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Entry {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub is_dir: bool,
    pub len: u64,
}

/// Every filesystem call the sandbox makes goes through here.
#[async_trait]
pub trait Filesystem: Send + Sync {
    async fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;
    async fn stat(&self, path: &Path) -> io::Result<Stat>;
    async fn read_dir(&self, path: &Path) -> io::Result<Vec<Entry>>;
    async fn create_dir(&self, path: &Path) -> io::Result<()>;
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    /// Remove a file, or a directory with everything below it.
    async fn remove_all(&self, path: &Path) -> io::Result<()>;
    async fn remove_file(&self, path: &Path) -> io::Result<()>;
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    async fn open(&self, path: &Path) -> io::Result<(ByteStream, u64)>;
    async fn create(&self, path: &Path) -> io::Result<ByteSink>;
    /// ZIP the subtree at `dir`, returning a reader over the finished archive.
    async fn archive(&self, dir: &Path) -> io::Result<(ByteStream, u64)>;
    /// Sum of regular file sizes below `dir`.
    async fn tree_size(&self, dir: &Path) -> io::Result<u64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

#[async_trait]
impl Filesystem for LocalFs {
    async fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        tokio::fs::canonicalize(path).await
    }

    async fn stat(&self, path: &Path) -> io::Result<Stat> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(Stat {
            is_dir: meta.is_dir(),
            len: meta.len(),
        })
    }

    async fn read_dir(&self, path: &Path) -> io::Result<Vec<Entry>> {
        let mut read_dir = tokio::fs::read_dir(path).await?;
        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let entry = match entry.metadata().await {
                Ok(meta) => Entry {
                    name,
                    is_directory: meta.is_dir(),
                    size: meta.len(),
                },
                Err(_) => Entry {
                    name,
                    is_directory: entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false),
                    size: 0,
                },
            };
            entries.push(entry);
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create_dir(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn remove_all(&self, path: &Path) -> io::Result<()> {
        let meta = tokio::fs::symlink_metadata(path).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        }
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn open(&self, path: &Path) -> io::Result<(ByteStream, u64)> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok((Box::new(file), len))
    }

    async fn create(&self, path: &Path) -> io::Result<ByteSink> {
        let file = tokio::fs::File::create(path).await?;
        Ok(Box::new(file))
    }

    async fn archive(&self, dir: &Path) -> io::Result<(ByteStream, u64)> {
        let dir = dir.to_path_buf();
        let (file, len) = tokio::task::spawn_blocking(move || spool_archive(&dir))
            .await
            .map_err(io::Error::other)??;
        Ok((Box::new(tokio::fs::File::from_std(file)), len))
    }

    async fn tree_size(&self, dir: &Path) -> io::Result<u64> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut total = 0u64;
            for entry in WalkDir::new(&dir).min_depth(1) {
                let entry = entry.map_err(io::Error::other)?;
                if entry.file_type().is_file() {
                    total = total.saturating_add(entry.metadata().map_err(io::Error::other)?.len());
                }
            }
            Ok(total)
        })
        .await
        .map_err(io::Error::other)?
    }
}

/// Write a ZIP of `dir` into an anonymous temp file, walking depth-first.
/// Entries are named by their path relative to `dir` with `/` separators.
fn spool_archive(dir: &Path) -> io::Result<(File, u64)> {
    let mut zip = ZipWriter::new(tempfile::tempfile()?);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).map_err(io::Error::other)?;
        let name = relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        zip.start_file(name, options).map_err(io::Error::other)?;
        let mut source = File::open(entry.path())?;
        io::copy(&mut source, &mut zip)?;
    }

    let mut file = zip.finish().map_err(io::Error::other)?;
    let len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;
    Ok((file, len))
}
