use std::{
    collections::{BTreeSet, HashMap},
    io::{self, Write},
    mem,
    pin::Pin,
    sync::Arc,
};

use async_trait::async_trait;
use futures::{
    io::{AsyncRead, AsyncWrite, Cursor},
    task::{Context, Poll},
};
use parking_lot::Mutex;

use crate::{
    array::ArrayStore,
    cell::DataType,
    mapper::{Mapper, StoreWrite},
    resolver::Resolver,
    schema::{Attribute, Filter, LogicalSpace},
};

/// A test implementation of Mapper that stores objects in RAM
///
pub(crate) struct MemoryMapper {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryMapper {
    pub(crate) fn new() -> Self {
        Self {
            objects: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl Mapper for MemoryMapper {
    async fn store(&self, path: &str) -> io::Result<Box<dyn StoreWrite + '_>> {
        Ok(Box::new(MemoryMapperStoreWrite::new(self, path)))
    }

    async fn load(&self, path: &str) -> io::Result<Option<Box<dyn AsyncRead + Unpin + Send + '_>>> {
        let objects = self.objects.lock();
        Ok(objects
            .get(path)
            .map(|object| Box::new(Cursor::new(object.clone())) as Box<dyn AsyncRead + Unpin + Send>))
    }

    async fn list(&self, dir: &str) -> io::Result<Vec<String>> {
        let prefix = format!("{dir}/");
        let objects = self.objects.lock();
        let names: BTreeSet<String> = objects
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .map(String::from)
            .collect();

        Ok(names.into_iter().collect())
    }

    async fn remove(&self, path: &str) -> io::Result<()> {
        let prefix = format!("{path}/");
        self.objects
            .lock()
            .retain(|key, _| key != path && !key.starts_with(&prefix));

        Ok(())
    }

    async fn size_of(&self, path: &str) -> io::Result<Option<u64>> {
        let objects = self.objects.lock();
        Ok(objects.get(path).map(|object| object.len() as u64))
    }
}

struct MemoryMapperStoreWrite<'a> {
    mapper: &'a MemoryMapper,
    path: String,
    buffer: Vec<u8>,
}

impl<'a> MemoryMapperStoreWrite<'a> {
    fn new(mapper: &'a MemoryMapper, path: &str) -> Self {
        Self {
            mapper,
            path: path.to_string(),
            buffer: Vec::new(),
        }
    }
}

impl<'a> AsyncWrite for MemoryMapperStoreWrite<'a> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(self.buffer.write(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl<'a> StoreWrite for MemoryMapperStoreWrite<'a> {
    async fn finish(mut self: Box<Self>) -> io::Result<()> {
        let object = mem::take(&mut self.buffer);
        self.mapper.objects.lock().insert(self.path.clone(), object);

        Ok(())
    }
}

pub(crate) fn resolver() -> Arc<Resolver> {
    Arc::new(Resolver::new(Box::new(MemoryMapper::new()), 1 << 20))
}

pub(crate) fn store() -> ArrayStore {
    ArrayStore::new(resolver())
}

pub(crate) fn attribute(dtype: DataType, fill: f64) -> Attribute {
    Attribute {
        name: String::from("intensity"),
        dtype,
        fill,
        filter: Filter::Zstd { level: 1 },
    }
}

/// A u16 space with the given extents and a fill value of 7.
pub(crate) fn space(extents: [usize; 5]) -> LogicalSpace {
    LogicalSpace::new(extents, attribute(DataType::U16, 7.0))
}

/// Show log output when tests are run with `RUST_LOG` set.
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
