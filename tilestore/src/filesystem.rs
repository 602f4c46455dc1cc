//! A concrete implementation of the `Mapper` interface for a local filesystem.
//!
use std::{
    io,
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite, Cursor};
use tokio::fs;
use uuid::Uuid;

use crate::mapper::{Mapper, StoreWrite};

const TEMP_SUFFIX: &str = ".tmp";

/// Stores objects as files under a root directory.
///
pub struct FsMapper {
    root: PathBuf,
}

impl FsMapper {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            full.push(segment);
        }

        full
    }
}

#[async_trait]
impl Mapper for FsMapper {
    /// Obtain an output stream for writing an object to the store.
    ///
    /// This implementation writes all data to memory and then writes a temporary file next to
    /// the destination when `finish` is called, renaming it into place once it is complete.
    ///
    async fn store(&self, path: &str) -> io::Result<Box<dyn StoreWrite + '_>> {
        Ok(Box::new(FsStoreWrite::new(self.path_of(path))))
    }

    async fn load(&self, path: &str) -> io::Result<Option<Box<dyn AsyncRead + Unpin + Send + '_>>> {
        match fs::read(self.path_of(path)).await {
            Ok(bytes) => {
                let stream: Box<dyn AsyncRead + Unpin + Send> = Box::new(Cursor::new(bytes));
                Ok(Some(stream))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list(&self, dir: &str) -> io::Result<Vec<String>> {
        let mut entries = match fs::read_dir(self.path_of(dir)).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err),
        };

        let mut names = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();

            // Objects still being written
            if name.starts_with('.') && name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            names.push(name);
        }

        Ok(names)
    }

    async fn remove(&self, path: &str) -> io::Result<()> {
        let path = self.path_of(path);
        let result = match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&path).await,
            Ok(_) => fs::remove_file(&path).await,
            Err(err) => Err(err),
        };

        match result {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            result => result,
        }
    }

    async fn size_of(&self, path: &str) -> io::Result<Option<u64>> {
        match fs::metadata(self.path_of(path)).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(metadata.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// A writer for writing an object to the filesystem
///
/// All writes will, in fact, be written to RAM until `FsStoreWrite::finish` is called.
///
struct FsStoreWrite {
    path: PathBuf,
    buffer: Vec<u8>,
}

impl FsStoreWrite {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            buffer: Vec::new(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.path
            .with_file_name(format!(".{name}.{}{TEMP_SUFFIX}", Uuid::new_v4().simple()))
    }
}

impl AsyncWrite for FsStoreWrite {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffer.extend_from_slice(buf);

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl StoreWrite for FsStoreWrite {
    async fn finish(self: Box<Self>) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp = self.temp_path();
        fs::write(&temp, &self.buffer).await?;
        if let Err(err) = fs::rename(&temp, &self.path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::{AsyncReadExt, AsyncWriteExt};

    async fn put(mapper: &FsMapper, path: &str, data: &[u8]) -> io::Result<()> {
        let mut stream = mapper.store(path).await?;
        stream.write_all(data).await?;
        stream.finish().await
    }

    async fn get(mapper: &FsMapper, path: &str) -> io::Result<Option<Vec<u8>>> {
        match mapper.load(path).await? {
            None => Ok(None),
            Some(mut stream) => {
                let mut data = vec![];
                stream.read_to_end(&mut data).await?;
                Ok(Some(data))
            }
        }
    }

    #[tokio::test]
    async fn test_store_load() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mapper = FsMapper::new(dir.path());

        put(&mapper, "0/__fragments/__1_1_a/data", b"hello").await?;
        assert_eq!(
            get(&mapper, "0/__fragments/__1_1_a/data").await?,
            Some(b"hello".to_vec())
        );
        assert_eq!(get(&mapper, "0/__fragments/__2_2_b/data").await?, None);
        assert_eq!(
            mapper.size_of("0/__fragments/__1_1_a/data").await?,
            Some(5)
        );
        assert_eq!(mapper.size_of("0/__fragments").await?, None);

        // Overwrite
        put(&mapper, "0/__fragments/__1_1_a/data", b"bye").await?;
        assert_eq!(
            get(&mapper, "0/__fragments/__1_1_a/data").await?,
            Some(b"bye".to_vec())
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_list_and_remove() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mapper = FsMapper::new(dir.path());

        put(&mapper, "0/__fragments/__1_1_a/__meta", b"a").await?;
        put(&mapper, "0/__fragments/__2_2_b/__meta", b"b").await?;
        put(&mapper, "0/__schema.json", b"{}").await?;

        // Simulate a writer that hasn't finished
        std::fs::write(dir.path().join("0/__fragments/.x.1234.tmp"), b"partial")?;

        let mut names = mapper.list("0/__fragments").await?;
        names.sort();
        assert_eq!(names, vec!["__1_1_a", "__2_2_b"]);
        assert!(mapper.list("1/__fragments").await?.is_empty());

        mapper.remove("0/__fragments/__1_1_a").await?;
        mapper.remove("0/__fragments/__9_9_z").await?;
        let names = mapper.list("0/__fragments").await?;
        assert_eq!(names, vec!["__2_2_b"]);

        mapper.remove("0/__schema.json").await?;
        assert_eq!(get(&mapper, "0/__schema.json").await?, None);

        Ok(())
    }

    #[tokio::test]
    async fn test_unfinished_write_is_invisible() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mapper = FsMapper::new(dir.path());

        let mut stream = mapper.store("0/object").await?;
        stream.write_all(b"not yet").await?;
        assert_eq!(get(&mapper, "0/object").await?, None);

        drop(stream);
        assert_eq!(get(&mapper, "0/object").await?, None);

        Ok(())
    }
}
