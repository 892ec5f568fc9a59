use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum FilesystemError {
    /// The requested path resolves outside the instance root. Never retried.
    #[error("invalid path resolution")]
    BadPathResolution,

    #[error("path does not exist")]
    NotExist,

    #[error("path already exists")]
    Exists,

    #[error("expected a file but found a directory")]
    IsDirectory,

    #[error("not enough disk space is available")]
    NotEnoughDiskSpace,

    #[error("cannot delete root server directory")]
    DeleteRootDirectory,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FilesystemError {
    fn from_io(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            FilesystemError::NotExist
        } else {
            FilesystemError::Io(e)
        }
    }
}

/// Read-only ownership settings the filesystem needs, decoupled from the
/// rest of the instance so there is no back-reference cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskOwner {
    pub uid: u32,
    pub gid: u32,
}

/// Path-sandboxed file API rooted at one instance's data directory. All
/// caller supplied paths are untrusted and pass through [`Filesystem::safe_path`]
/// before anything touches the disk.
pub struct Filesystem {
    root: PathBuf,
    owner: DiskOwner,

    disk_used: AtomicI64,
    disk_limit: AtomicI64,

    /// Seconds before the cached usage value goes stale.
    check_interval: Duration,
    last_check_millis: AtomicU64,
    lookup_in_progress: AtomicBool,
    epoch: Instant,
}

impl Filesystem {
    pub fn new(root: impl Into<PathBuf>, disk_limit: i64, check_interval_secs: u64, owner: DiskOwner) -> Self {
        let root: PathBuf = root.into();
        // Resolve a symlinked root once up front; every jail check compares
        // against this value.
        let root = std::fs::canonicalize(&root).unwrap_or(root);

        Self {
            root,
            owner,
            disk_used: AtomicI64::new(0),
            disk_limit: AtomicI64::new(disk_limit),
            check_interval: Duration::from_secs(check_interval_secs),
            last_check_millis: AtomicU64::new(0),
            lookup_in_progress: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn disk_used(&self) -> i64 {
        self.disk_used.load(Ordering::SeqCst)
    }

    pub fn disk_limit(&self) -> i64 {
        self.disk_limit.load(Ordering::SeqCst)
    }

    pub fn set_disk_limit(&self, limit: i64) {
        self.disk_limit.store(limit, Ordering::SeqCst);
    }

    fn add_disk(&self, delta: i64) {
        self.disk_used.fetch_add(delta, Ordering::SeqCst);
    }

    /// Creates the instance root if needed.
    pub async fn ensure_data_directory(&self) -> Result<(), FilesystemError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Joins an untrusted path onto the root, resolving `.` and `..`
    /// lexically. `..` may walk above the root here; the caller decides what
    /// that means.
    fn unsafe_path(&self, p: impl AsRef<Path>) -> PathBuf {
        let mut out = self.root.clone();
        for c in p.as_ref().components() {
            match c {
                Component::Normal(seg) => out.push(seg),
                Component::ParentDir => {
                    out.pop();
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }
        out
    }

    fn is_in_root(&self, p: &Path) -> bool {
        p.starts_with(&self.root)
    }

    /// Resolves an untrusted path to the canonical location it would touch.
    ///
    /// Symlinks are evaluated for every component that exists on disk; a
    /// missing suffix is accepted as a path-to-be-created under the deepest
    /// existing prefix. The result is the root itself or a strict descendant,
    /// anything else fails with [`FilesystemError::BadPathResolution`].
    pub async fn safe_path(&self, p: impl AsRef<Path>) -> Result<PathBuf, FilesystemError> {
        let joined = self.unsafe_path(p);

        match tokio::fs::canonicalize(&joined).await {
            Ok(resolved) => {
                if self.is_in_root(&resolved) {
                    return Ok(resolved);
                }
                Err(FilesystemError::BadPathResolution)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Walk up until a component exists, resolve that prefix, and
                // re-attach the missing suffix to the resolved location.
                let mut prefix = joined.as_path();
                while let Some(parent) = prefix.parent() {
                    prefix = parent;
                    if !self.is_in_root(prefix) {
                        return Err(FilesystemError::BadPathResolution);
                    }
                    if let Ok(resolved) = tokio::fs::canonicalize(prefix).await {
                        let suffix = joined
                            .strip_prefix(prefix)
                            .expect("prefix was derived from joined");
                        let out = resolved.join(suffix);
                        if !self.is_in_root(&out) {
                            return Err(FilesystemError::BadPathResolution);
                        }

                        // Canonicalization failed, but the first "missing"
                        // component may still exist as a dangling symlink.
                        // Opening through it would follow the link, so its
                        // target has to stay inside the root too.
                        if let Some(first) = suffix.components().next() {
                            let link = resolved.join(first);
                            if let Ok(meta) = tokio::fs::symlink_metadata(&link).await {
                                if meta.file_type().is_symlink() {
                                    let target = tokio::fs::read_link(&link).await?;
                                    if !self.is_in_root(&lexical_join(&resolved, &target)) {
                                        return Err(FilesystemError::BadPathResolution);
                                    }
                                }
                            }
                        }

                        return Ok(out);
                    }
                }
                Err(FilesystemError::BadPathResolution)
            }
            Err(e) => Err(FilesystemError::Io(e)),
        }
    }

    /// Reads a file inside the jail and returns its contents.
    pub async fn readfile(&self, p: impl AsRef<Path>) -> Result<Vec<u8>, FilesystemError> {
        let cleaned = self.safe_path(p).await?;

        let meta = tokio::fs::metadata(&cleaned)
            .await
            .map_err(FilesystemError::from_io)?;
        if meta.is_dir() {
            return Err(FilesystemError::IsDirectory);
        }

        Ok(tokio::fs::read(&cleaned).await?)
    }

    /// Writes `data` to a file inside the jail, creating missing parent
    /// directories and truncating any previous contents. Enforces the disk
    /// quota before a single byte is written; a failed write never adjusts
    /// the usage counter.
    pub async fn writefile(&self, p: impl AsRef<Path>, data: &[u8]) -> Result<(), FilesystemError> {
        let cleaned = self.safe_path(p).await?;

        let mut current_size = 0i64;
        match tokio::fs::metadata(&cleaned).await {
            Ok(meta) => {
                if meta.is_dir() {
                    return Err(FilesystemError::IsDirectory);
                }
                current_size = meta.len() as i64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FilesystemError::Io(e)),
        }

        let delta = data.len() as i64 - current_size;
        self.has_space_for(delta)?;

        if let Some(parent) = cleaned.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut f = tokio::fs::File::create(&cleaned).await?;
        f.write_all(data).await?;
        f.flush().await?;

        self.add_disk(delta);
        Ok(())
    }

    /// Creates `parents/name` recursively. Directories do not count against
    /// the quota.
    pub async fn create_directory(
        &self,
        name: impl AsRef<Path>,
        parents: impl AsRef<Path>,
    ) -> Result<(), FilesystemError> {
        let cleaned = self
            .safe_path(parents.as_ref().join(name.as_ref()))
            .await?;
        tokio::fs::create_dir_all(cleaned).await?;
        Ok(())
    }

    /// Renames a file or directory within the jail, creating missing parent
    /// directories for the target.
    pub async fn rename(
        &self,
        from: impl AsRef<Path>,
        to: impl AsRef<Path>,
    ) -> Result<(), FilesystemError> {
        let cleaned_from = self.safe_path(from).await?;
        let cleaned_to = self.safe_path(to).await?;

        if cleaned_to == self.root || tokio::fs::symlink_metadata(&cleaned_to).await.is_ok() {
            return Err(FilesystemError::Exists);
        }

        if tokio::fs::symlink_metadata(&cleaned_from).await.is_err() {
            return Err(FilesystemError::NotExist);
        }

        if let Some(parent) = cleaned_to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::rename(&cleaned_from, &cleaned_to)
            .await
            .map_err(FilesystemError::from_io)
    }

    /// Copies a file next to itself using the ` copy` suffix convention:
    /// `source.txt` becomes `source copy.txt`, then `source copy 1.txt` and
    /// so on.
    pub async fn copy(&self, p: impl AsRef<Path>) -> Result<(), FilesystemError> {
        let cleaned = self.safe_path(p).await?;

        let meta = match tokio::fs::metadata(&cleaned).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(FilesystemError::NotExist),
            Err(_) => return Err(FilesystemError::NotExist),
        };

        let size = meta.len() as i64;
        self.has_space_for(size)?;

        let parent = cleaned
            .parent()
            .ok_or(FilesystemError::BadPathResolution)?;
        let stem = cleaned
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let extension = cleaned
            .extension()
            .map(|s| format!(".{}", s.to_string_lossy()))
            .unwrap_or_default();

        let mut suffix = " copy".to_string();
        for n in 0..51 {
            if n > 0 {
                suffix = format!(" copy {n}");
            }
            let candidate = parent.join(format!("{stem}{suffix}{extension}"));
            if tokio::fs::symlink_metadata(&candidate).await.is_err() {
                tokio::fs::copy(&cleaned, &candidate).await?;
                self.add_disk(size);
                return Ok(());
            }
        }

        // Fifty copies of one file is operator error, not a code path worth
        // supporting further.
        Err(FilesystemError::Exists)
    }

    /// Recursively sets ownership of a path to the configured system user.
    pub async fn chown(&self, p: impl AsRef<Path>) -> Result<(), FilesystemError> {
        let cleaned = self.safe_path(p).await?;
        let owner = self.owner;

        tokio::task::spawn_blocking(move || chown_recursive(&cleaned, owner))
            .await
            .map_err(|e| FilesystemError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    /// Deletes a file or directory. The root itself is refused, a missing
    /// target is a success, and a symlink is removed without touching its
    /// target. The parent is resolved through the jail so a symlinked
    /// intermediate directory cannot redirect the removal outside the
    /// root, while the final component itself is never dereferenced.
    pub async fn delete(&self, p: impl AsRef<Path>) -> Result<(), FilesystemError> {
        let resolved = self.unsafe_path(p);
        if !self.is_in_root(&resolved) {
            return Err(FilesystemError::BadPathResolution);
        }
        if resolved == self.root {
            return Err(FilesystemError::DeleteRootDirectory);
        }

        let name = resolved
            .file_name()
            .ok_or(FilesystemError::BadPathResolution)?;
        let parent = resolved.parent().unwrap_or(&self.root);
        let parent_rel = parent.strip_prefix(&self.root).unwrap_or(Path::new(""));
        let target = self.safe_path(parent_rel).await?.join(name);

        let meta = match tokio::fs::symlink_metadata(&target).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(FilesystemError::Io(e)),
        };

        if meta.file_type().is_symlink() {
            // The subtracted size is the link's own on-disk size, never the
            // target's.
            tokio::fs::remove_file(&target).await?;
            self.add_disk(-(meta.len() as i64));
        } else if meta.is_dir() {
            let size = directory_size(target.clone()).await?;
            tokio::fs::remove_dir_all(&target).await?;
            self.add_disk(-size);
        } else {
            tokio::fs::remove_file(&target).await?;
            self.add_disk(-(meta.len() as i64));
        }

        Ok(())
    }

    /// Lists a directory inside the jail, directories first.
    pub async fn list_directory(
        &self,
        p: impl AsRef<Path>,
    ) -> Result<Vec<DirectoryEntry>, FilesystemError> {
        let cleaned = self.safe_path(p).await?;

        let mut out = Vec::new();
        let mut rd = tokio::fs::read_dir(&cleaned)
            .await
            .map_err(FilesystemError::from_io)?;
        while let Some(entry) = rd.next_entry().await? {
            let meta = entry.metadata().await?;
            out.push(DirectoryEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                directory: meta.is_dir(),
                size: if meta.is_file() { meta.len() } else { 0 },
            });
        }

        out.sort_by(|a, b| b.directory.cmp(&a.directory).then(a.name.cmp(&b.name)));
        Ok(out)
    }

    fn has_space_for(&self, delta: i64) -> Result<(), FilesystemError> {
        let limit = self.disk_limit();
        if limit == 0 {
            return Ok(());
        }
        if self.disk_used() + delta > limit {
            return Err(FilesystemError::NotEnoughDiskSpace);
        }
        Ok(())
    }

    /// Answers the quota question from the cached counter, re-walking the
    /// volume first when the cache has gone stale. Pass `allow_stale` when an
    /// approximate answer is fine (e.g. boot-time priming).
    pub async fn has_space_available(&self, allow_stale: bool) -> bool {
        let usage = self.disk_usage(allow_stale).await.unwrap_or(0);

        let limit = self.disk_limit();
        if limit == 0 {
            return true;
        }
        usage <= limit
    }

    pub async fn disk_usage(&self, allow_stale: bool) -> Result<i64, FilesystemError> {
        let now_millis = self.epoch.elapsed().as_millis() as u64;
        let stale = {
            // Zero means no walk has happened yet.
            let last = self.last_check_millis.load(Ordering::SeqCst);
            last == 0
                || Duration::from_millis(now_millis.saturating_sub(last)) > self.check_interval
        };

        if stale && !allow_stale {
            // Only one walker at a time; everyone else settles for the
            // cached value while the walk runs.
            if self
                .lookup_in_progress
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let result = directory_size(self.root.clone()).await;
                self.lookup_in_progress.store(false, Ordering::SeqCst);

                let size = result?;
                self.disk_used.store(size, Ordering::SeqCst);
                self.last_check_millis
                    .store(self.epoch.elapsed().as_millis() as u64 + 1, Ordering::SeqCst);
                return Ok(size);
            }
        }

        Ok(self.disk_used())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub directory: bool,
    pub size: u64,
}

/// Resolves a symlink target to the absolute location it points at, without
/// touching the disk. Relative targets are taken from `base` (the link's
/// parent); `..` never walks below `/`.
fn lexical_join(base: &Path, p: &Path) -> PathBuf {
    let mut out = if p.is_absolute() {
        PathBuf::from("/")
    } else {
        base.to_path_buf()
    };
    for c in p.components() {
        match c {
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// Total apparent size of everything under `root`. Symlinks contribute their
/// own size and are not followed.
async fn directory_size(root: PathBuf) -> Result<i64, FilesystemError> {
    let mut total = 0i64;
    let mut stack = vec![root];

    while let Some(dir) = stack.pop() {
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(FilesystemError::Io(e)),
        };

        while let Some(entry) = rd.next_entry().await? {
            let meta = entry.metadata().await;
            let link_meta = tokio::fs::symlink_metadata(entry.path()).await?;
            if link_meta.file_type().is_symlink() {
                total += link_meta.len() as i64;
            } else if link_meta.is_dir() {
                stack.push(entry.path());
            } else if let Ok(meta) = meta {
                total += meta.len() as i64;
            }
        }
    }

    Ok(total)
}

fn chown_recursive(path: &Path, owner: DiskOwner) -> Result<(), FilesystemError> {
    #[cfg(unix)]
    {
        let meta = std::fs::symlink_metadata(path).map_err(FilesystemError::from_io)?;
        std::os::unix::fs::lchown(path, Some(owner.uid), Some(owner.gid))?;
        if meta.is_dir() {
            for entry in std::fs::read_dir(path)? {
                chown_recursive(&entry?.path(), owner)?;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (path, owner);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _outer: tempfile::TempDir,
        fs: Filesystem,
        outer_path: PathBuf,
    }

    /// Mirrors the layout the daemon uses in production: an outer directory
    /// standing in for the host, with the jail root one level below it.
    fn fixture() -> Fixture {
        let outer = tempfile::tempdir().unwrap();
        let outer_path = outer.path().canonicalize().unwrap();
        let root = outer_path.join("server");
        std::fs::create_dir_all(&root).unwrap();

        Fixture {
            fs: Filesystem::new(&root, 0, 150, DiskOwner::default()),
            _outer: outer,
            outer_path,
        }
    }

    #[tokio::test]
    async fn safe_path_cleans_relative_forms() {
        let fx = fixture();
        let root = fx.fs.path().to_path_buf();

        for input in ["test.txt", "/test.txt", "./test.txt", "/foo/../test.txt"] {
            assert_eq!(fx.fs.safe_path(input).await.unwrap(), root.join("test.txt"));
        }

        assert_eq!(
            fx.fs.safe_path("/foo/bar").await.unwrap(),
            root.join("foo/bar")
        );
        assert_eq!(
            fx.fs
                .safe_path("/foo/bar/baz/quaz/../../ducks/testing.txt")
                .await
                .unwrap(),
            root.join("foo/bar/ducks/testing.txt")
        );
    }

    #[tokio::test]
    async fn safe_path_resolves_root_for_empty_input() {
        let fx = fixture();
        assert_eq!(fx.fs.safe_path("").await.unwrap(), fx.fs.path());
        assert_eq!(fx.fs.safe_path("/").await.unwrap(), fx.fs.path());
    }

    #[tokio::test]
    async fn safe_path_blocks_escapes() {
        let fx = fixture();
        for input in ["../test.txt", "/../test.txt", "./foo/../../test.txt", ".."] {
            assert!(matches!(
                fx.fs.safe_path(input).await,
                Err(FilesystemError::BadPathResolution)
            ));
        }
    }

    #[tokio::test]
    async fn jailed_write_then_read_round_trips() {
        let fx = fixture();

        fx.fs
            .writefile("/some/nested/test.txt", b"test file content")
            .await
            .unwrap();

        let data = fx.fs.readfile("/some/nested/test.txt").await.unwrap();
        assert_eq!(data, b"test file content");
        assert_eq!(fx.fs.disk_used(), 17);
    }

    #[tokio::test]
    async fn write_truncates_existing_contents() {
        let fx = fixture();
        fx.fs.writefile("test.txt", b"original data").await.unwrap();
        fx.fs.writefile("test.txt", b"new data").await.unwrap();

        assert_eq!(fx.fs.readfile("test.txt").await.unwrap(), b"new data");
        assert_eq!(fx.fs.disk_used(), "new data".len() as i64);
    }

    #[tokio::test]
    async fn write_rejects_escape_attempts() {
        let fx = fixture();
        let err = fx
            .fs
            .writefile("/some/../foo/../../test.txt", b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, FilesystemError::BadPathResolution));
    }

    #[tokio::test]
    async fn write_over_quota_fails_without_side_effects() {
        let fx = fixture();
        fx.fs.set_disk_limit(1024);

        let big = vec![7u8; 1025];
        let err = fx.fs.writefile("big", &big).await.unwrap_err();
        assert!(matches!(err, FilesystemError::NotEnoughDiskSpace));
        assert_eq!(fx.fs.disk_used(), 0);
        assert!(fx.fs.readfile("big").await.is_err());
    }

    #[tokio::test]
    async fn read_of_directory_fails_with_is_directory() {
        let fx = fixture();
        fx.fs.create_directory("test.txt", "/").await.unwrap();
        assert!(matches!(
            fx.fs.readfile("test.txt").await,
            Err(FilesystemError::IsDirectory)
        ));
    }

    #[tokio::test]
    async fn read_of_missing_file_fails_with_not_exist() {
        let fx = fixture();
        assert!(matches!(
            fx.fs.readfile("missing.txt").await,
            Err(FilesystemError::NotExist)
        ));
    }

    #[tokio::test]
    async fn create_directory_builds_missing_parents() {
        let fx = fixture();
        fx.fs.create_directory("test", "foo/bar/baz").await.unwrap();

        let meta = std::fs::metadata(fx.fs.path().join("foo/bar/baz/test")).unwrap();
        assert!(meta.is_dir());
        assert_eq!(fx.fs.disk_used(), 0);
    }

    #[tokio::test]
    async fn create_directory_rejects_escapes() {
        let fx = fixture();
        assert!(matches!(
            fx.fs.create_directory("test", "e/../../something").await,
            Err(FilesystemError::BadPathResolution)
        ));
    }

    #[tokio::test]
    async fn rename_moves_files_and_creates_parents() {
        let fx = fixture();
        fx.fs.writefile("source.txt", b"text content").await.unwrap();

        fx.fs
            .rename("source.txt", "nested/folder/target.txt")
            .await
            .unwrap();
        assert!(fx.fs.path().join("nested/folder/target.txt").is_file());
        assert!(!fx.fs.path().join("source.txt").exists());
    }

    #[tokio::test]
    async fn rename_round_trip_restores_original_tree() {
        let fx = fixture();
        fx.fs.writefile("a.txt", b"contents").await.unwrap();

        fx.fs.rename("a.txt", "b.txt").await.unwrap();
        fx.fs.rename("b.txt", "a.txt").await.unwrap();

        assert_eq!(fx.fs.readfile("a.txt").await.unwrap(), b"contents");
        assert!(!fx.fs.path().join("b.txt").exists());
    }

    #[tokio::test]
    async fn rename_refuses_existing_target_and_root() {
        let fx = fixture();
        fx.fs.writefile("source.txt", b"source").await.unwrap();
        fx.fs.writefile("target.txt", b"target").await.unwrap();

        assert!(matches!(
            fx.fs.rename("source.txt", "target.txt").await,
            Err(FilesystemError::Exists)
        ));
        assert!(matches!(
            fx.fs.rename("source.txt", "/").await,
            Err(FilesystemError::Exists)
        ));
    }

    #[tokio::test]
    async fn rename_of_missing_source_fails_with_not_exist() {
        let fx = fixture();
        assert!(matches!(
            fx.fs.rename("missing.txt", "target.txt").await,
            Err(FilesystemError::NotExist)
        ));
    }

    #[tokio::test]
    async fn rename_rejects_paths_outside_the_root() {
        let fx = fixture();
        std::fs::write(fx.outer_path.join("ext-source.txt"), "external").unwrap();
        fx.fs.writefile("my_file.txt", b"internal").await.unwrap();

        assert!(matches!(
            fx.fs.rename("../ext-source.txt", "target.txt").await,
            Err(FilesystemError::BadPathResolution)
        ));
        assert!(matches!(
            fx.fs.rename("my_file.txt", "../my_file.txt").await,
            Err(FilesystemError::BadPathResolution)
        ));
    }

    #[tokio::test]
    async fn copy_uses_the_copy_suffix_sequence() {
        let fx = fixture();
        fx.fs.writefile("source.txt", b"test content").await.unwrap();

        fx.fs.copy("source.txt").await.unwrap();
        fx.fs.copy("source.txt").await.unwrap();

        for name in ["source.txt", "source copy.txt", "source copy 1.txt"] {
            assert!(fx.fs.path().join(name).is_file(), "missing {name}");
        }
        assert_eq!(fx.fs.disk_used(), 3 * "test content".len() as i64);
    }

    #[tokio::test]
    async fn copy_works_inside_nested_directories() {
        let fx = fixture();
        fx.fs
            .writefile("nested/in/dir/source.txt", b"test content")
            .await
            .unwrap();

        fx.fs.copy("nested/in/dir/source.txt").await.unwrap();
        assert!(fx.fs.path().join("nested/in/dir/source copy.txt").is_file());
    }

    #[tokio::test]
    async fn copy_refuses_directories_and_missing_sources() {
        let fx = fixture();
        fx.fs.create_directory("dir", "/").await.unwrap();

        assert!(matches!(
            fx.fs.copy("dir").await,
            Err(FilesystemError::NotExist)
        ));
        assert!(matches!(
            fx.fs.copy("foo.txt").await,
            Err(FilesystemError::NotExist)
        ));
    }

    #[tokio::test]
    async fn copy_enforces_the_disk_quota() {
        let fx = fixture();
        fx.fs.writefile("source.txt", b"test content").await.unwrap();
        fx.fs.set_disk_limit(2);

        assert!(matches!(
            fx.fs.copy("source.txt").await,
            Err(FilesystemError::NotEnoughDiskSpace)
        ));
    }

    #[tokio::test]
    async fn delete_refuses_the_root_directory() {
        let fx = fixture();
        let err = fx.fs.delete("/").await.unwrap_err();
        assert_eq!(err.to_string(), "cannot delete root server directory");
    }

    #[tokio::test]
    async fn delete_of_missing_target_is_a_noop_success() {
        let fx = fixture();
        fx.fs.writefile("source.txt", b"test content").await.unwrap();

        fx.fs.delete("missing.txt").await.unwrap();
        assert!(fx.fs.path().join("source.txt").is_file());
    }

    #[tokio::test]
    async fn delete_subtracts_subtree_size() {
        let fx = fixture();
        for p in [
            "foo/source.txt",
            "foo/bar/source.txt",
            "foo/bar/baz/source.txt",
        ] {
            fx.fs.writefile(p, b"test content").await.unwrap();
        }
        assert_eq!(fx.fs.disk_used(), 3 * "test content".len() as i64);

        fx.fs.delete("foo").await.unwrap();
        assert_eq!(fx.fs.disk_used(), 0);
        assert!(!fx.fs.path().join("foo").exists());
    }

    #[tokio::test]
    async fn delete_does_not_reach_outside_the_root() {
        let fx = fixture();
        std::fs::write(fx.outer_path.join("ext-source.txt"), "external").unwrap();

        assert!(matches!(
            fx.fs.delete("../ext-source.txt").await,
            Err(FilesystemError::BadPathResolution)
        ));
        assert!(fx.outer_path.join("ext-source.txt").is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_file_outside_the_root_is_unreadable() {
        let fx = fixture();
        let malicious = fx.outer_path.join("malicious.txt");
        std::fs::write(&malicious, "external content").unwrap();
        std::os::unix::fs::symlink(&malicious, fx.fs.path().join("symlinked.txt")).unwrap();

        assert!(matches!(
            fx.fs.readfile("symlinked.txt").await,
            Err(FilesystemError::BadPathResolution)
        ));
        assert!(matches!(
            fx.fs.writefile("symlinked.txt", b"testing").await,
            Err(FilesystemError::BadPathResolution)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn writes_through_a_symlinked_directory_are_blocked() {
        let fx = fixture();
        let external = fx.outer_path.join("malicious_dir");
        std::fs::create_dir_all(&external).unwrap();
        std::os::unix::fs::symlink(&external, fx.fs.path().join("external_dir")).unwrap();

        assert!(matches!(
            fx.fs.writefile("external_dir/foo.txt", b"testing").await,
            Err(FilesystemError::BadPathResolution)
        ));
        assert!(matches!(
            fx.fs.create_directory("my_dir", "external_dir").await,
            Err(FilesystemError::BadPathResolution)
        ));
        assert!(matches!(
            fx.fs.rename("external_dir", "foo").await,
            Err(FilesystemError::BadPathResolution)
        ));
        assert!(matches!(
            fx.fs.copy("external_dir").await,
            Err(FilesystemError::BadPathResolution)
        ));
        assert!(matches!(
            fx.fs.chown("external_dir").await,
            Err(FilesystemError::BadPathResolution)
        ));
        assert!(matches!(
            fx.fs.delete("external_dir/foo.txt").await,
            Err(FilesystemError::BadPathResolution)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn delete_through_a_symlinked_directory_leaves_the_target_alone() {
        let fx = fixture();
        let external = fx.outer_path.join("malicious_dir");
        std::fs::create_dir_all(&external).unwrap();
        std::fs::write(external.join("foo.txt"), "external content").unwrap();
        std::os::unix::fs::symlink(&external, fx.fs.path().join("external_dir")).unwrap();

        assert!(matches!(
            fx.fs.delete("external_dir/foo.txt").await,
            Err(FilesystemError::BadPathResolution)
        ));
        assert!(external.join("foo.txt").is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dangling_symlink_pointing_outside_is_not_writable() {
        let fx = fixture();
        // The link target does not exist, so canonicalizing the link fails
        // and the path looks like one that is about to be created.
        let target = fx.outer_path.join("cron-target");
        std::os::unix::fs::symlink(&target, fx.fs.path().join("evil")).unwrap();
        fx.fs.writefile("src.txt", b"internal").await.unwrap();

        assert!(matches!(
            fx.fs.writefile("evil", b"payload").await,
            Err(FilesystemError::BadPathResolution)
        ));
        assert!(matches!(
            fx.fs.rename("src.txt", "evil").await,
            Err(FilesystemError::BadPathResolution)
        ));
        assert!(!target.exists());
        assert!(fx.fs.path().join("src.txt").is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dangling_symlink_staying_inside_the_root_is_usable() {
        let fx = fixture();
        std::os::unix::fs::symlink(
            fx.fs.path().join("notyet.txt"),
            fx.fs.path().join("link.txt"),
        )
        .unwrap();

        fx.fs.writefile("link.txt", b"contents").await.unwrap();
        assert_eq!(fx.fs.readfile("notyet.txt").await.unwrap(), b"contents");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deleting_a_symlink_removes_only_the_link() {
        let fx = fixture();
        let malicious = fx.outer_path.join("malicious.txt");
        std::fs::write(&malicious, "external content").unwrap();
        std::os::unix::fs::symlink(&malicious, fx.fs.path().join("symlinked.txt")).unwrap();

        fx.fs.delete("symlinked.txt").await.unwrap();

        assert!(malicious.is_file());
        assert!(!fx.fs.path().join("symlinked.txt").exists());
    }

    #[tokio::test]
    async fn disk_usage_recomputation_walks_the_volume() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().canonicalize().unwrap().join("server");
        std::fs::create_dir_all(&root).unwrap();
        // Zero interval: every non-stale-tolerant query re-walks.
        let fs = Filesystem::new(&root, 0, 0, DiskOwner::default());

        std::fs::write(root.join("a.bin"), vec![0u8; 100]).unwrap();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/b.bin"), vec![0u8; 50]).unwrap();

        assert_eq!(fs.disk_usage(false).await.unwrap(), 150);
        assert!(fs.has_space_available(false).await);

        fs.set_disk_limit(120);
        assert!(!fs.has_space_available(false).await);
    }

    #[tokio::test]
    async fn stale_tolerant_usage_query_uses_the_counter() {
        let fx = fixture();
        fx.fs.disk_used.store(42, Ordering::SeqCst);
        assert_eq!(fx.fs.disk_usage(true).await.unwrap(), 42);
    }
}
