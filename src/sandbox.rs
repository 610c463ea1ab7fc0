use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::storage::{ByteSink, ByteStream, Entry, Filesystem, LocalFs};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("invalid path: {0}")]
    BadPath(&'static str),
    #[error("no such file or directory")]
    NotFound,
    #[error("target already exists")]
    Conflict,
    #[error("malformed upload: {0}")]
    Malformed(String),
    #[error("filesystem error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for SandboxError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => Self::NotFound,
            io::ErrorKind::AlreadyExists => Self::Conflict,
            _ => Self::Io(err),
        }
    }
}

impl From<multer::Error> for SandboxError {
    fn from(err: multer::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// A caller-supplied path, reduced to plain name segments relative to a user
/// root. Leading slashes and `.` segments are dropped; `..` is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualPath(PathBuf);

impl VirtualPath {
    pub fn parse(raw: Option<&str>) -> Result<Self, SandboxError> {
        let raw = raw
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .ok_or(SandboxError::BadPath("path is required"))?;

        let mut relative = PathBuf::new();
        for segment in raw.split(['/', '\\']) {
            match segment {
                "" | "." => continue,
                ".." => return Err(SandboxError::BadPath("parent path segments are not allowed")),
                _ => {
                    let mut components = Path::new(segment).components();
                    match (components.next(), components.next()) {
                        (Some(Component::Normal(name)), None) => relative.push(name),
                        _ => return Err(SandboxError::BadPath("invalid path segment")),
                    }
                }
            }
        }
        Ok(Self(relative))
    }

    pub fn is_root(&self) -> bool {
        self.0.as_os_str().is_empty()
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// The path as clients see it: `/` followed by `/`-joined segments.
    pub fn to_virtual_string(&self) -> String {
        let segments: Vec<_> = self
            .0
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect();
        format!("/{}", segments.join("/"))
    }

    pub fn file_name(&self) -> Option<String> {
        self.0
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadKind {
    File,
    Archive,
}

pub struct Download {
    pub file_name: String,
    pub kind: DownloadKind,
    pub body: ByteStream,
    pub len: u64,
}

/// File operations confined to `{root}/{username}`.
#[derive(Clone)]
pub struct Sandbox {
    root: PathBuf,
    fs: Arc<dyn Filesystem>,
}

impl Sandbox {
    pub fn new(root: impl Into<PathBuf>, fs: Arc<dyn Filesystem>) -> Self {
        Self {
            root: root.into(),
            fs,
        }
    }

    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::new(root, Arc::new(LocalFs))
    }

    pub fn user_root(&self, username: &str) -> PathBuf {
        self.root.join(username)
    }

    /// Join `path` onto the user root and check that the deepest existing
    /// ancestor really lives below it once symlinks are resolved.
    async fn resolve(&self, username: &str, path: &VirtualPath) -> Result<PathBuf, SandboxError> {
        let user_root = self.user_root(username);
        let target = user_root.join(path.as_path());
        let real_root = self.fs.canonicalize(&user_root).await?;

        let mut probe = target.as_path();
        loop {
            match self.fs.canonicalize(probe).await {
                Ok(real) if real.starts_with(&real_root) => return Ok(target),
                Ok(real) => {
                    warn!(target: "files", user = username, resolved = %real.display(), "path escapes user root");
                    return Err(SandboxError::BadPath("path escapes the user directory"));
                }
                Err(err) if is_missing(&err) => {
                    probe = match probe.parent() {
                        Some(parent) if parent.starts_with(&user_root) => parent,
                        _ => return Err(SandboxError::NotFound),
                    };
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Create the user root if it is missing.
    pub async fn ensure_user_root(&self, username: &str) -> Result<(), SandboxError> {
        self.fs.create_dir_all(&self.user_root(username)).await?;
        Ok(())
    }

    pub async fn list(
        &self,
        username: &str,
        raw_path: Option<&str>,
        filter: Option<&str>,
    ) -> Result<Vec<Entry>, SandboxError> {
        let path = VirtualPath::parse(raw_path)?;
        let dir = self.resolve(username, &path).await?;
        if !self.fs.stat(&dir).await?.is_dir {
            return Err(SandboxError::BadPath("path is not a directory"));
        }

        let mut entries = self.fs.read_dir(&dir).await?;
        if let Some(filter) = filter.filter(|filter| !filter.is_empty()) {
            entries.retain(|entry| entry.name.contains(filter));
        }
        Ok(entries)
    }

    /// Like [`Sandbox::list`], but directory sizes are the total of the files
    /// they contain.
    pub async fn list_with_tree_sizes(
        &self,
        username: &str,
        raw_path: Option<&str>,
    ) -> Result<Vec<Entry>, SandboxError> {
        let mut entries = self.list(username, raw_path, None).await?;
        let dir = self
            .resolve(username, &VirtualPath::parse(raw_path)?)
            .await?;
        for entry in entries.iter_mut().filter(|entry| entry.is_directory) {
            entry.size = self.fs.tree_size(&dir.join(&entry.name)).await?;
        }
        Ok(entries)
    }

    pub async fn download(
        &self,
        username: &str,
        raw_path: Option<&str>,
    ) -> Result<Download, SandboxError> {
        let path = VirtualPath::parse(raw_path)?;
        let target = self.resolve(username, &path).await?;
        let name = path.file_name().unwrap_or_else(|| username.to_string());

        if self.fs.stat(&target).await?.is_dir {
            let (body, len) = self.fs.archive(&target).await?;
            return Ok(Download {
                file_name: format!("{name}.zip"),
                kind: DownloadKind::Archive,
                body,
                len,
            });
        }

        let (body, len) = self.fs.open(&target).await?;
        Ok(Download {
            file_name: name,
            kind: DownloadKind::File,
            body,
            len,
        })
    }

    /// Store every file part of a multipart body under the target directory,
    /// creating the directory when missing. Returns the stored file names.
    pub async fn upload<R>(
        &self,
        username: &str,
        raw_path: Option<&str>,
        content_type: Option<&str>,
        body: R,
        idle: Duration,
    ) -> Result<Vec<String>, SandboxError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let path = VirtualPath::parse(raw_path)?;
        let content_type =
            content_type.ok_or_else(|| SandboxError::Malformed("missing Content-Type".into()))?;
        let boundary = multer::parse_boundary(content_type)?;

        let dir = self.resolve(username, &path).await?;
        match self.fs.stat(&dir).await {
            Ok(stat) if !stat.is_dir => {
                return Err(SandboxError::BadPath("upload target is not a directory"))
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.fs.create_dir_all(&dir).await?
            }
            Err(err) => return Err(err.into()),
        }

        let mut multipart = multer::Multipart::with_reader(body, boundary);
        let mut stored = Vec::new();
        while let Some(mut field) = within(idle, multipart.next_field()).await?? {
            let declared = field.file_name().map(str::to_string);
            let Some(declared) = declared.filter(|name| !name.is_empty()) else {
                while within(idle, field.chunk()).await??.is_some() {}
                continue;
            };
            let file_name =
                sanitize_file_name(&declared).ok_or(SandboxError::BadPath("invalid file name"))?;

            let dest = dir.join(&file_name);
            let mut sink = self.fs.create(&dest).await?;
            if let Err(err) = copy_field(&mut field, &mut sink, idle).await {
                drop(sink);
                if let Err(cleanup) = self.fs.remove_file(&dest).await {
                    warn!(target: "files", %cleanup, dest = %dest.display(), "failed to remove partial upload");
                }
                return Err(err);
            }
            debug!(target: "files", user = username, file = %file_name, "stored upload part");
            stored.push(file_name);
        }
        Ok(stored)
    }

    /// Create exactly one directory level.
    pub async fn create_directory(
        &self,
        username: &str,
        raw_path: Option<&str>,
    ) -> Result<(), SandboxError> {
        let path = VirtualPath::parse(raw_path)?;
        if path.is_root() {
            return Err(SandboxError::Conflict);
        }
        let target = self.resolve(username, &path).await?;
        match self.fs.stat(&target).await {
            Ok(_) => return Err(SandboxError::Conflict),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.fs.create_dir(&target).await?;
        Ok(())
    }

    pub async fn delete(&self, username: &str, raw_path: Option<&str>) -> Result<(), SandboxError> {
        let path = VirtualPath::parse(raw_path)?;
        if path.is_root() {
            return Err(SandboxError::BadPath("refusing to remove the user directory"));
        }
        let target = self.resolve(username, &path).await?;
        self.fs.remove_all(&target).await?;
        Ok(())
    }

    pub async fn rename(
        &self,
        username: &str,
        raw_old: Option<&str>,
        raw_new: Option<&str>,
    ) -> Result<(), SandboxError> {
        let old = VirtualPath::parse(raw_old)?;
        let new = VirtualPath::parse(raw_new)?;
        if old.is_root() || new.is_root() {
            return Err(SandboxError::BadPath("the user directory cannot be moved"));
        }
        if new.as_path().starts_with(old.as_path()) {
            return Err(SandboxError::BadPath("cannot move a path into itself"));
        }

        let from = self.resolve(username, &old).await?;
        let to = self.resolve(username, &new).await?;
        self.fs.stat(&from).await?;
        match self.fs.stat(&to).await {
            Ok(_) => return Err(SandboxError::Conflict),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = to.parent() {
            self.fs.create_dir_all(parent).await?;
        }
        self.fs.rename(&from, &to).await?;
        Ok(())
    }
}

/// A path that runs through a regular file is as absent as a missing one.
fn is_missing(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

async fn within<F: std::future::Future>(idle: Duration, fut: F) -> Result<F::Output, SandboxError> {
    timeout(idle, fut)
        .await
        .map_err(|_| SandboxError::Malformed("timed out waiting for upload data".into()))
}

async fn copy_field(
    field: &mut multer::Field<'_>,
    sink: &mut ByteSink,
    idle: Duration,
) -> Result<(), SandboxError> {
    while let Some(chunk) = within(idle, field.chunk()).await?? {
        sink.write_all(&chunk).await?;
    }
    sink.flush().await?;
    Ok(())
}

/// Reduce a client-declared file name to its final segment.
pub fn sanitize_file_name(raw: &str) -> Option<String> {
    let last = raw.rsplit(['/', '\\']).next()?;
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return None;
    }
    Some(cleaned.chars().take(255).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    use crate::storage::Stat;

    /// Fails every call and remembers that it was made.
    #[derive(Default)]
    struct RecordingFs {
        calls: Mutex<Vec<&'static str>>,
    }

    impl RecordingFs {
        fn touched(&self, call: &'static str) -> io::Error {
            self.calls.lock().unwrap().push(call);
            io::Error::other("recording filesystem")
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Filesystem for RecordingFs {
        async fn canonicalize(&self, _: &Path) -> io::Result<PathBuf> {
            Err(self.touched("canonicalize"))
        }
        async fn stat(&self, _: &Path) -> io::Result<Stat> {
            Err(self.touched("stat"))
        }
        async fn read_dir(&self, _: &Path) -> io::Result<Vec<Entry>> {
            Err(self.touched("read_dir"))
        }
        async fn create_dir(&self, _: &Path) -> io::Result<()> {
            Err(self.touched("create_dir"))
        }
        async fn create_dir_all(&self, _: &Path) -> io::Result<()> {
            Err(self.touched("create_dir_all"))
        }
        async fn remove_all(&self, _: &Path) -> io::Result<()> {
            Err(self.touched("remove_all"))
        }
        async fn remove_file(&self, _: &Path) -> io::Result<()> {
            Err(self.touched("remove_file"))
        }
        async fn rename(&self, _: &Path, _: &Path) -> io::Result<()> {
            Err(self.touched("rename"))
        }
        async fn open(&self, _: &Path) -> io::Result<(ByteStream, u64)> {
            Err(self.touched("open"))
        }
        async fn create(&self, _: &Path) -> io::Result<ByteSink> {
            Err(self.touched("create"))
        }
        async fn archive(&self, _: &Path) -> io::Result<(ByteStream, u64)> {
            Err(self.touched("archive"))
        }
        async fn tree_size(&self, _: &Path) -> io::Result<u64> {
            Err(self.touched("tree_size"))
        }
    }

    const BOUNDARY: &str = "XyZ0123";
    const IDLE: Duration = Duration::from_secs(5);

    fn multipart_content_type() -> String {
        format!("multipart/form-data; boundary={BOUNDARY}")
    }

    fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, file_name, data) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match file_name {
                Some(file_name) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn local_sandbox() -> (TempDir, Sandbox) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("alice")).unwrap();
        let sandbox = Sandbox::local(dir.path());
        (dir, sandbox)
    }

    #[test]
    fn test_virtual_path_normalizes() {
        let path = VirtualPath::parse(Some("/docs/./notes//a.txt")).unwrap();
        assert_eq!(path.as_path(), Path::new("docs/notes/a.txt"));
        assert_eq!(path.file_name().as_deref(), Some("a.txt"));
        assert!(VirtualPath::parse(Some("/")).unwrap().is_root());
        assert_eq!(path.to_virtual_string(), "/docs/notes/a.txt");
        assert_eq!(VirtualPath::parse(Some("/")).unwrap().to_virtual_string(), "/");
    }

    #[test]
    fn test_virtual_path_rejects_traversal_and_empty() {
        for raw in ["..", "../etc", "a/../../b", "a\\..\\b", "docs/.."] {
            assert!(
                matches!(VirtualPath::parse(Some(raw)), Err(SandboxError::BadPath(_))),
                "{raw} accepted"
            );
        }
        assert!(matches!(VirtualPath::parse(None), Err(SandboxError::BadPath(_))));
        assert!(matches!(VirtualPath::parse(Some("  ")), Err(SandboxError::BadPath(_))));
    }

    #[test]
    fn test_dotted_names_are_not_traversal() {
        let path = VirtualPath::parse(Some("release..notes.txt")).unwrap();
        assert_eq!(path.as_path(), Path::new("release..notes.txt"));
    }

    #[tokio::test]
    async fn test_traversal_never_reaches_filesystem() {
        let fs = Arc::new(RecordingFs::default());
        let sandbox = Sandbox::new("/srv/uploads", fs.clone());
        let content_type = multipart_content_type();

        for raw in ["..", "../bob", "docs/../../bob/secret"] {
            let bad = Some(raw);
            assert!(matches!(sandbox.list("alice", bad, None).await, Err(SandboxError::BadPath(_))));
            assert!(matches!(
                sandbox.list_with_tree_sizes("alice", bad).await,
                Err(SandboxError::BadPath(_))
            ));
            assert!(matches!(sandbox.download("alice", bad).await, Err(SandboxError::BadPath(_))));
            assert!(matches!(
                sandbox
                    .upload("alice", bad, Some(&content_type), &b""[..], IDLE)
                    .await,
                Err(SandboxError::BadPath(_))
            ));
            assert!(matches!(
                sandbox.create_directory("alice", bad).await,
                Err(SandboxError::BadPath(_))
            ));
            assert!(matches!(sandbox.delete("alice", bad).await, Err(SandboxError::BadPath(_))));
            assert!(matches!(
                sandbox.rename("alice", bad, Some("ok")).await,
                Err(SandboxError::BadPath(_))
            ));
            assert!(matches!(
                sandbox.rename("alice", Some("ok"), bad).await,
                Err(SandboxError::BadPath(_))
            ));
        }

        assert!(fs.calls().is_empty(), "filesystem touched: {:?}", fs.calls());
    }

    #[tokio::test]
    async fn test_valid_path_does_reach_filesystem() {
        let fs = Arc::new(RecordingFs::default());
        let sandbox = Sandbox::new("/srv/uploads", fs.clone());
        assert!(matches!(
            sandbox.delete("alice", Some("a.txt")).await,
            Err(SandboxError::Io(_))
        ));
        assert_eq!(fs.calls(), vec!["canonicalize"]);
    }

    #[tokio::test]
    async fn test_create_directory_then_list_parent() {
        let (_dir, sandbox) = local_sandbox();
        sandbox.create_directory("alice", Some("photos")).await.unwrap();

        let entries = sandbox.list("alice", Some("/"), None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "photos");
        assert!(entries[0].is_directory);
    }

    #[tokio::test]
    async fn test_create_directory_conflict_and_missing_parent() {
        let (_dir, sandbox) = local_sandbox();
        sandbox.create_directory("alice", Some("photos")).await.unwrap();
        assert!(matches!(
            sandbox.create_directory("alice", Some("photos")).await,
            Err(SandboxError::Conflict)
        ));
        assert!(matches!(
            sandbox.create_directory("alice", Some("/")).await,
            Err(SandboxError::Conflict)
        ));
        assert!(matches!(
            sandbox.create_directory("alice", Some("a/b/c")).await,
            Err(SandboxError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_list_filter_and_file_target() {
        let (dir, sandbox) = local_sandbox();
        std::fs::write(dir.path().join("alice/report.pdf"), b"pdf").unwrap();
        std::fs::write(dir.path().join("alice/notes.txt"), b"txt").unwrap();

        let entries = sandbox.list("alice", Some("/"), Some(".txt")).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "notes.txt");
        assert_eq!(entries[0].size, 3);

        assert!(matches!(
            sandbox.list("alice", Some("notes.txt"), None).await,
            Err(SandboxError::BadPath(_))
        ));
        assert!(matches!(
            sandbox.list("alice", Some("missing"), None).await,
            Err(SandboxError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found_twice() {
        let (_dir, sandbox) = local_sandbox();
        for _ in 0..2 {
            assert!(matches!(
                sandbox.delete("alice", Some("ghost.txt")).await,
                Err(SandboxError::NotFound)
            ));
        }
    }

    #[tokio::test]
    async fn test_paths_through_a_file_are_not_found() {
        let (dir, sandbox) = local_sandbox();
        std::fs::write(dir.path().join("alice/readme.txt"), b"r").unwrap();
        let through = Some("readme.txt/ghost");

        for _ in 0..2 {
            assert!(matches!(sandbox.delete("alice", through).await, Err(SandboxError::NotFound)));
        }
        assert!(matches!(sandbox.download("alice", through).await, Err(SandboxError::NotFound)));
        assert!(matches!(
            sandbox.create_directory("alice", through).await,
            Err(SandboxError::NotFound)
        ));
        assert!(matches!(sandbox.list("alice", through, None).await, Err(SandboxError::NotFound)));
    }

    #[tokio::test]
    async fn test_ensure_user_root_for_new_user() {
        let (dir, sandbox) = local_sandbox();
        assert!(matches!(
            sandbox.list("carol", Some("/"), None).await,
            Err(SandboxError::NotFound)
        ));
        sandbox.ensure_user_root("carol").await.unwrap();
        sandbox.ensure_user_root("carol").await.unwrap();
        assert!(dir.path().join("carol").is_dir());
        assert!(sandbox.list("carol", Some("/"), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_recursive_and_root_refused() {
        let (dir, sandbox) = local_sandbox();
        std::fs::create_dir_all(dir.path().join("alice/a/b")).unwrap();
        std::fs::write(dir.path().join("alice/a/b/c.txt"), b"c").unwrap();

        sandbox.delete("alice", Some("a")).await.unwrap();
        assert!(!dir.path().join("alice/a").exists());
        assert!(matches!(
            sandbox.delete("alice", Some("/")).await,
            Err(SandboxError::BadPath(_))
        ));
        assert!(dir.path().join("alice").exists());
    }

    #[tokio::test]
    async fn test_rename_creates_destination_parents() {
        let (dir, sandbox) = local_sandbox();
        std::fs::write(dir.path().join("alice/a.txt"), b"a").unwrap();

        sandbox
            .rename("alice", Some("a.txt"), Some("archive/2024/a.txt"))
            .await
            .unwrap();
        assert!(!dir.path().join("alice/a.txt").exists());
        assert_eq!(std::fs::read(dir.path().join("alice/archive/2024/a.txt")).unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_rename_errors() {
        let (dir, sandbox) = local_sandbox();
        std::fs::write(dir.path().join("alice/a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("alice/b.txt"), b"b").unwrap();
        std::fs::create_dir(dir.path().join("alice/folder")).unwrap();

        assert!(matches!(
            sandbox.rename("alice", Some("missing"), Some("x")).await,
            Err(SandboxError::NotFound)
        ));
        assert!(matches!(
            sandbox.rename("alice", Some("a.txt"), Some("b.txt")).await,
            Err(SandboxError::Conflict)
        ));
        assert!(matches!(
            sandbox.rename("alice", Some("folder"), Some("folder/inner")).await,
            Err(SandboxError::BadPath(_))
        ));
        assert!(matches!(
            sandbox.rename("alice", None, Some("x")).await,
            Err(SandboxError::BadPath(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_then_download_round_trip() {
        let (dir, sandbox) = local_sandbox();
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let body = multipart_body(&[
            ("comment", None, b"ignored field"),
            ("files", Some("data.bin"), &payload),
        ]);

        let stored = sandbox
            .upload(
                "alice",
                Some("incoming"),
                Some(&multipart_content_type()),
                &body[..],
                IDLE,
            )
            .await
            .unwrap();
        assert_eq!(stored, vec!["data.bin".to_string()]);
        assert!(dir.path().join("alice/incoming").is_dir());

        let mut download = sandbox
            .download("alice", Some("incoming/data.bin"))
            .await
            .unwrap();
        assert_eq!(download.kind, DownloadKind::File);
        assert_eq!(download.file_name, "data.bin");
        assert_eq!(download.len, payload.len() as u64);
        let mut read = Vec::new();
        download.body.read_to_end(&mut read).await.unwrap();
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn test_upload_overwrites_and_strips_directories_from_names() {
        let (dir, sandbox) = local_sandbox();
        std::fs::write(dir.path().join("alice/x.txt"), b"old").unwrap();
        let body = multipart_body(&[("files", Some("../../x.txt"), b"new")]);

        let stored = sandbox
            .upload("alice", Some("/"), Some(&multipart_content_type()), &body[..], IDLE)
            .await
            .unwrap();
        assert_eq!(stored, vec!["x.txt".to_string()]);
        assert_eq!(std::fs::read(dir.path().join("alice/x.txt")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_upload_requires_boundary_and_directory_target() {
        let (dir, sandbox) = local_sandbox();
        std::fs::write(dir.path().join("alice/file"), b"f").unwrap();
        let body = multipart_body(&[("files", Some("a"), b"a")]);

        assert!(matches!(
            sandbox
                .upload("alice", Some("/"), Some("text/plain"), &body[..], IDLE)
                .await,
            Err(SandboxError::Malformed(_))
        ));
        assert!(matches!(
            sandbox
                .upload("alice", Some("/"), None, &body[..], IDLE)
                .await,
            Err(SandboxError::Malformed(_))
        ));
        assert!(matches!(
            sandbox
                .upload("alice", Some("file"), Some(&multipart_content_type()), &body[..], IDLE)
                .await,
            Err(SandboxError::BadPath(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_upload_leaves_no_partial_file() {
        let (dir, sandbox) = local_sandbox();
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"cut.bin\"\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(&[1u8; 512]);

        let result = sandbox
            .upload("alice", Some("/"), Some(&multipart_content_type()), &body[..], IDLE)
            .await;
        assert!(matches!(result, Err(SandboxError::Malformed(_))));
        assert!(!dir.path().join("alice/cut.bin").exists());
    }

    #[tokio::test]
    async fn test_download_directory_as_archive() {
        let (dir, sandbox) = local_sandbox();
        std::fs::create_dir_all(dir.path().join("alice/docs/sub")).unwrap();
        std::fs::write(dir.path().join("alice/docs/sub/a.txt"), b"a").unwrap();

        let download = sandbox.download("alice", Some("docs")).await.unwrap();
        assert_eq!(download.kind, DownloadKind::Archive);
        assert_eq!(download.file_name, "docs.zip");
        assert!(download.len > 0);

        let root = sandbox.download("alice", Some("/")).await.unwrap();
        assert_eq!(root.file_name, "alice.zip");
    }

    #[tokio::test]
    async fn test_list_with_tree_sizes() {
        let (dir, sandbox) = local_sandbox();
        std::fs::create_dir_all(dir.path().join("alice/docs/sub")).unwrap();
        std::fs::write(dir.path().join("alice/docs/a"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("alice/docs/sub/b"), vec![0u8; 23]).unwrap();

        let entries = sandbox.list_with_tree_sizes("alice", Some("/")).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size, 123);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_rejected() {
        let (dir, sandbox) = local_sandbox();
        std::fs::create_dir(dir.path().join("bob")).unwrap();
        std::fs::write(dir.path().join("bob/secret.txt"), b"s").unwrap();
        std::os::unix::fs::symlink(dir.path().join("bob"), dir.path().join("alice/peek")).unwrap();

        assert!(matches!(
            sandbox.download("alice", Some("peek/secret.txt")).await,
            Err(SandboxError::BadPath(_))
        ));
        assert!(matches!(
            sandbox.create_directory("alice", Some("peek/new")).await,
            Err(SandboxError::BadPath(_))
        ));
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf").as_deref(), Some("report.pdf"));
        assert_eq!(sanitize_file_name("C:\\Users\\me\\a.txt").as_deref(), Some("a.txt"));
        assert_eq!(sanitize_file_name("dir/.."), None);
        assert_eq!(sanitize_file_name("  "), None);
    }
}
