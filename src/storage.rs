//! 上传文件存储：单一根目录下的平铺文件，负责路径穿越校验与读写。

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use std::error::Error as StdError;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::pin;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, ErrorKind};
use tracing::{debug, info, warn};

use crate::atomic::{AtomicFile, is_temp_name};
use crate::config::StorageConfig;

/// 以单一目录为根的平铺文件存储。
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
    absolute_root: PathBuf,
}

impl Storage {
    /// 校验配置的存储位置，不访问文件系统。
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        if config.location.trim().is_empty() {
            return Err(StorageError::storage(
                "File upload location can not be Empty.",
            ));
        }
        let root = PathBuf::from(&config.location);
        let absolute_root = std::path::absolute(&root)
            .map(|path| normalize(&path))
            .map_err(|err| StorageError::storage_with("Could not resolve storage location", err))?;
        Ok(Self {
            root,
            absolute_root,
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 创建根目录（含父级），已存在时直接成功。
    pub async fn init(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|err| StorageError::storage_with("Could not initialize storage", err))
    }

    /// 将 `content` 写入根目录下的 `name`，覆盖同名文件。
    pub async fn store<S, B, E>(&self, name: &str, content: S) -> Result<(), StorageError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        if name.is_empty() {
            return Err(StorageError::storage(
                "Failed to store file with empty filename.",
            ));
        }
        let Some(target) = self.resolve_child(name) else {
            return Err(StorageError::storage(
                "Cannot store file outside current directory.",
            ));
        };
        if target
            .file_name()
            .and_then(|value| value.to_str())
            .is_some_and(is_temp_name)
        {
            return Err(StorageError::storage(format!(
                "Cannot store file with reserved name {name}"
            )));
        }

        let failed =
            |err: io::Error| StorageError::storage_with(format!("Failed to store file {name}"), err);
        let mut atomic = AtomicFile::new(&target).await.map_err(failed)?;
        let written: io::Result<u64> = async {
            let mut content = pin!(content);
            let mut total = 0u64;
            while let Some(chunk) = content.next().await {
                let chunk = chunk.map_err(io::Error::other)?;
                let chunk = chunk.as_ref();
                if !chunk.is_empty() {
                    atomic.file_mut().write_all(chunk).await?;
                    total += chunk.len() as u64;
                }
            }
            Ok(total)
        }
        .await;

        match written {
            Ok(0) => {
                atomic.cleanup().await;
                Err(StorageError::storage("Failed to store empty file."))
            }
            Ok(size) => {
                atomic.finalize().await.map_err(failed)?;
                info!(filename = name, size, "stored file");
                Ok(())
            }
            Err(err) => {
                atomic.cleanup().await;
                Err(failed(err))
            }
        }
    }

    /// 打开根目录，返回一次性的直接子项流（相对路径）。
    ///
    /// 跳过未完成写入的临时文件；非 UTF-8 文件名无法映射为下载地址，记录警告后跳过。
    pub async fn load_all(&self) -> Result<StoredFiles, StorageError> {
        let entries = fs::read_dir(&self.root)
            .await
            .map_err(|err| StorageError::storage_with("Failed to read stored files", err))?;
        Ok(stream::try_unfold(entries, next_stored_path).boxed())
    }

    /// 将 `name` 拼接到根目录，不做任何校验。
    pub fn load(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// 打开可下载的已存储文件；不存在、不可读或越出根目录时返回 `FileNotFound`。
    pub async fn load_as_resource(&self, name: &str) -> Result<StoredResource, StorageError> {
        let message = || format!("Could not read file: {name}");
        let Some(path) = self.resolve_child(name) else {
            return Err(StorageError::not_found(message()));
        };
        let filename = path
            .file_name()
            .and_then(|value| value.to_str())
            .map(str::to_string)
            .ok_or_else(|| StorageError::not_found(message()))?;
        let file = File::open(&path)
            .await
            .map_err(|err| StorageError::not_found_with(message(), err))?;
        let metadata = file
            .metadata()
            .await
            .map_err(|err| StorageError::not_found_with(message(), err))?;
        if !metadata.is_file() {
            return Err(StorageError::not_found(message()));
        }

        Ok(StoredResource {
            filename,
            size: metadata.len(),
            file,
        })
    }

    /// 递归删除根目录，失败只记录日志。
    pub async fn delete_all(&self) {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => info!(root = %self.root.display(), "deleted stored files"),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(root = %self.root.display(), "storage root already absent");
            }
            Err(err) => {
                warn!(root = %self.root.display(), error = %err, "failed to delete stored files");
            }
        }
    }

    /// 解析 `name`，仅当规范化后的父目录恰为根目录时接受。
    fn resolve_child(&self, name: &str) -> Option<PathBuf> {
        let candidate = std::path::absolute(self.load(name)).ok()?;
        let candidate = normalize(&candidate);
        (candidate.parent() == Some(self.absolute_root.as_path())).then_some(candidate)
    }
}

/// 词法规范化：去掉 `.`，`..` 折叠到上一级。
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => continue,
            Component::ParentDir => {
                if normalized.file_name().is_some() {
                    normalized.pop();
                } else if !normalized.has_root() {
                    normalized.push(component.as_os_str());
                }
            }
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                normalized.push(component.as_os_str());
            }
        }
    }
    normalized
}

/// 根目录直接子项的一次性流，读取失败以 `StorageError` 形式产出。
pub type StoredFiles = BoxStream<'static, Result<PathBuf, StorageError>>;

async fn next_stored_path(
    mut entries: fs::ReadDir,
) -> Result<Option<(PathBuf, fs::ReadDir)>, StorageError> {
    loop {
        let entry = entries
            .next_entry()
            .await
            .map_err(|err| StorageError::storage_with("Failed to read stored files", err))?;
        let Some(entry) = entry else {
            return Ok(None);
        };
        let name = entry.file_name();
        let Some(value) = name.to_str() else {
            warn!(name = ?name, "skipping stored file with non UTF-8 name");
            continue;
        };
        if is_temp_name(value) {
            continue;
        }
        return Ok(Some((PathBuf::from(value), entries)));
    }
}

/// 已打开的存储文件及其文件名。
#[derive(Debug)]
pub struct StoredResource {
    filename: String,
    size: u64,
    file: File,
}

impl StoredResource {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn into_file(self) -> File {
        self.file
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{message}")]
    Storage {
        message: String,
        #[source]
        source: Option<io::Error>,
    },
    #[error("{message}")]
    FileNotFound {
        message: String,
        #[source]
        source: Option<io::Error>,
    },
}

impl StorageError {
    pub fn storage(message: impl Into<String>) -> Self {
        StorageError::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with(message: impl Into<String>, source: io::Error) -> Self {
        StorageError::Storage {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        StorageError::FileNotFound {
            message: message.into(),
            source: None,
        }
    }

    pub fn not_found_with(message: impl Into<String>, source: io::Error) -> Self {
        StorageError::FileNotFound {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::FileNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{TryStreamExt, stream};
    use tempfile::tempdir;
    use uuid::Uuid;
    use tokio::io::AsyncReadExt;

    fn make_storage() -> (tempfile::TempDir, Storage) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("upload-dir");
        let storage = Storage::new(&StorageConfig {
            location: root.to_string_lossy().into_owned(),
        })
        .expect("storage");
        (temp, storage)
    }

    async fn init_storage() -> (tempfile::TempDir, Storage) {
        let (temp, storage) = make_storage();
        storage.init().await.expect("init");
        (temp, storage)
    }

    fn content(data: &'static [u8]) -> impl Stream<Item = Result<&'static [u8], io::Error>> {
        stream::iter(vec![Ok(data)])
    }

    fn entry_count(path: &Path) -> usize {
        std::fs::read_dir(path).expect("list").count()
    }

    #[test]
    fn new_rejects_empty_location() {
        for location in ["", "   "] {
            let result = Storage::new(&StorageConfig {
                location: location.to_string(),
            });
            assert!(matches!(result, Err(StorageError::Storage { .. })));
        }
    }

    #[test]
    fn new_does_not_create_root() {
        let (_temp, storage) = make_storage();
        assert!(!storage.root_path().exists());
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let (_temp, storage) = init_storage().await;
        storage.init().await.expect("second init");
        assert!(storage.root_path().is_dir());
    }

    #[tokio::test]
    async fn init_fails_when_root_is_a_file() {
        let (_temp, storage) = make_storage();
        std::fs::write(storage.root_path(), b"occupied").expect("write file");
        let result = storage.init().await;
        assert!(matches!(result, Err(StorageError::Storage { source: Some(_), .. })));
    }

    #[tokio::test]
    async fn load_non_existent() {
        let (_temp, storage) = init_storage().await;
        assert!(!storage.load("foo.txt").exists());
    }

    #[tokio::test]
    async fn save_and_load() {
        let (_temp, storage) = init_storage().await;
        storage
            .store("foo.txt", content(b"Hello, World"))
            .await
            .expect("store");

        let path = storage.load("foo.txt");
        assert!(path.exists());
        assert_eq!(std::fs::read(path).expect("read"), b"Hello, World");
    }

    #[tokio::test]
    async fn store_concatenates_chunks() {
        let (_temp, storage) = init_storage().await;
        let chunks = stream::iter(vec![
            Ok::<_, io::Error>(b"Spring ".as_slice()),
            Ok(b"".as_slice()),
            Ok(b"Framework".as_slice()),
        ]);
        storage.store("chunks.txt", chunks).await.expect("store");
        assert_eq!(
            std::fs::read(storage.load("chunks.txt")).expect("read"),
            b"Spring Framework"
        );
    }

    #[tokio::test]
    async fn store_overwrites_existing_file() {
        let (_temp, storage) = init_storage().await;
        storage.store("foo.txt", content(b"first")).await.expect("store");
        storage.store("foo.txt", content(b"second")).await.expect("store");

        assert_eq!(std::fs::read(storage.load("foo.txt")).expect("read"), b"second");
        assert_eq!(entry_count(storage.root_path()), 1);
    }

    #[tokio::test]
    async fn save_relative_path_not_permitted() {
        let (temp, storage) = init_storage().await;
        let result = storage.store("../foo.txt", content(b"Hello, World")).await;

        assert!(matches!(result, Err(StorageError::Storage { .. })));
        assert!(!temp.path().join("foo.txt").exists());
        assert_eq!(entry_count(storage.root_path()), 0);
    }

    #[tokio::test]
    async fn save_absolute_path_not_permitted() {
        let (_temp, storage) = init_storage().await;
        let result = storage.store("/etc/passwd", content(b"Hello, World")).await;
        assert!(matches!(result, Err(StorageError::Storage { .. })));
    }

    #[tokio::test]
    async fn save_nested_path_not_permitted() {
        let (_temp, storage) = init_storage().await;
        std::fs::create_dir(storage.root_path().join("bar")).expect("mkdir");
        let result = storage.store("bar/foo.txt", content(b"Hello, World")).await;

        assert!(matches!(result, Err(StorageError::Storage { .. })));
        assert!(!storage.root_path().join("bar/foo.txt").exists());
    }

    #[tokio::test]
    async fn save_current_dir_not_permitted() {
        let (_temp, storage) = init_storage().await;
        let result = storage.store(".", content(b"Hello, World")).await;
        assert!(matches!(result, Err(StorageError::Storage { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn save_backslash_filename_permitted() {
        let (_temp, storage) = init_storage().await;
        let name = "\\etc\\passwd";
        storage
            .store(name, content(b"Hello, World"))
            .await
            .expect("store");
        assert!(storage.root_path().join(name).exists());
    }

    #[tokio::test]
    async fn save_permitted_when_path_normalizes_into_root() {
        let (_temp, storage) = init_storage().await;
        storage
            .store("bar/../foo.txt", content(b"Hello, World"))
            .await
            .expect("store");

        assert_eq!(
            std::fs::read(storage.root_path().join("foo.txt")).expect("read"),
            b"Hello, World"
        );
        assert!(!storage.root_path().join("bar").exists());
    }

    #[tokio::test]
    async fn store_rejects_empty_content() {
        let (_temp, storage) = init_storage().await;
        let result = storage.store("empty.txt", content(b"")).await;

        assert!(matches!(result, Err(StorageError::Storage { .. })));
        assert_eq!(entry_count(storage.root_path()), 0);
    }

    #[tokio::test]
    async fn store_rejects_empty_name() {
        let (_temp, storage) = init_storage().await;
        let result = storage.store("", content(b"Hello, World")).await;

        assert!(matches!(result, Err(StorageError::Storage { .. })));
        assert_eq!(entry_count(storage.root_path()), 0);
    }

    #[tokio::test]
    async fn store_reports_stream_failure_with_filename() {
        let (_temp, storage) = init_storage().await;
        let chunks = stream::iter(vec![
            Ok(b"partial".as_slice()),
            Err(io::Error::other("connection reset")),
        ]);
        let err = storage
            .store("broken.txt", chunks)
            .await
            .expect_err("stream failure");

        assert!(err.to_string().contains("broken.txt"));
        assert!(!err.is_not_found());
        assert_eq!(entry_count(storage.root_path()), 0);
    }

    async fn list_names(storage: &Storage) -> Vec<PathBuf> {
        let mut names = storage
            .load_all()
            .await
            .expect("load all")
            .try_collect::<Vec<_>>()
            .await
            .expect("collect");
        names.sort();
        names
    }

    #[tokio::test]
    async fn load_all_lists_direct_entries() {
        let (_temp, storage) = init_storage().await;
        storage.store("first.txt", content(b"1")).await.expect("store");
        storage.store("second.txt", content(b"2")).await.expect("store");

        assert_eq!(
            list_names(&storage).await,
            vec![PathBuf::from("first.txt"), PathBuf::from("second.txt")]
        );
    }

    #[tokio::test]
    async fn load_all_is_consumed_once() {
        let (_temp, storage) = init_storage().await;
        storage.store("only.txt", content(b"1")).await.expect("store");

        let mut listing = storage.load_all().await.expect("load all");
        let first = listing.try_next().await.expect("first entry");
        assert_eq!(first, Some(PathBuf::from("only.txt")));
        assert_eq!(listing.try_next().await.expect("end of listing"), None);
    }

    #[tokio::test]
    async fn load_all_skips_in_flight_writes() {
        let (_temp, storage) = init_storage().await;
        let pending = format!(".filedrop-{}.tmp", Uuid::new_v4());
        std::fs::write(storage.root_path().join(pending), b"x").expect("write temp");
        storage.store("done.txt", content(b"1")).await.expect("store");

        assert_eq!(list_names(&storage).await, vec![PathBuf::from("done.txt")]);
    }

    #[tokio::test]
    async fn load_all_lists_names_sharing_the_temp_prefix() {
        let (_temp, storage) = init_storage().await;
        storage
            .store(".filedrop-notes.txt", content(b"hi"))
            .await
            .expect("store");

        assert!(storage.load(".filedrop-notes.txt").exists());
        assert_eq!(
            list_names(&storage).await,
            vec![PathBuf::from(".filedrop-notes.txt")]
        );
    }

    #[tokio::test]
    async fn store_rejects_temp_file_names() {
        let (_temp, storage) = init_storage().await;
        let name = format!(".filedrop-{}.tmp", Uuid::new_v4());
        let result = storage.store(&name, content(b"hi")).await;

        assert!(matches!(result, Err(StorageError::Storage { .. })));
        assert_eq!(entry_count(storage.root_path()), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn load_all_skips_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let (_temp, storage) = init_storage().await;
        let raw = OsStr::from_bytes(b"bad\xff.txt");
        std::fs::write(storage.root_path().join(raw), b"x").expect("write raw name");
        storage.store("good.txt", content(b"1")).await.expect("store");

        assert_eq!(list_names(&storage).await, vec![PathBuf::from("good.txt")]);
    }

    #[tokio::test]
    async fn load_all_fails_without_root() {
        let (_temp, storage) = make_storage();
        let result = storage.load_all().await;
        assert!(matches!(result, Err(StorageError::Storage { .. })));
    }

    #[tokio::test]
    async fn load_as_resource_reads_stored_file() {
        let (_temp, storage) = init_storage().await;
        storage
            .store("test.txt", content(b"Spring Framework"))
            .await
            .expect("store");

        let resource = storage.load_as_resource("test.txt").await.expect("resource");
        assert_eq!(resource.filename(), "test.txt");
        assert_eq!(resource.size(), 16);

        let mut body = String::new();
        resource
            .into_file()
            .read_to_string(&mut body)
            .await
            .expect("read");
        assert_eq!(body, "Spring Framework");
    }

    #[tokio::test]
    async fn load_as_resource_missing_file_is_not_found() {
        let (_temp, storage) = init_storage().await;
        let err = storage
            .load_as_resource("missing.txt")
            .await
            .expect_err("missing");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Could not read file: missing.txt");
    }

    #[tokio::test]
    async fn load_as_resource_rejects_directories_and_traversal() {
        let (temp, storage) = init_storage().await;
        std::fs::create_dir(storage.root_path().join("nested")).expect("mkdir");
        std::fs::write(temp.path().join("secret.txt"), b"secret").expect("write outside");

        for name in ["nested", "../secret.txt", "", ".."] {
            let err = storage.load_as_resource(name).await.expect_err(name);
            assert!(err.is_not_found(), "{name} should be not found");
        }
    }

    #[tokio::test]
    async fn delete_all_then_init_yields_empty_root() {
        let (_temp, storage) = init_storage().await;
        storage.store("foo.txt", content(b"data")).await.expect("store");

        storage.delete_all().await;
        assert!(!storage.root_path().exists());

        storage.init().await.expect("init");
        assert_eq!(entry_count(storage.root_path()), 0);
    }

    #[tokio::test]
    async fn delete_all_tolerates_missing_root() {
        let (_temp, storage) = make_storage();
        storage.delete_all().await;
        assert!(!storage.root_path().exists());
    }

    #[test]
    fn normalize_folds_parent_segments() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(normalize(Path::new("/../a")), PathBuf::from("/a"));
        assert_eq!(normalize(Path::new("a/../../b")), PathBuf::from("../b"));
    }
}
