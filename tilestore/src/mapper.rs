use std::io;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite};

/// A trait for storing and loading named objects from an arbitrary object store.
///
/// Object names are `/` separated paths relative to the root of the store. An object becomes
/// visible to `load` and `list` only once the writer returned by `store` has been finished, so
/// readers never observe a partially written object.
///
#[async_trait]
pub trait Mapper: Send + Sync {
    /// Obtain an output stream for writing an object to the store.
    ///
    /// The object is published under `path` by the `finish` method of the returned
    /// `StoreWrite` object. An existing object at `path` is replaced.
    ///
    async fn store(&self, path: &str) -> io::Result<Box<dyn StoreWrite + '_>>;

    /// Obtain an input stream for reading an object from the store.
    ///
    /// Should return `Option::None` if given `path` isn't in the store.
    ///
    async fn load(&self, path: &str) -> io::Result<Option<Box<dyn AsyncRead + Unpin + Send + '_>>>;

    /// List the names of the immediate children of `dir`, in no particular order.
    ///
    /// Children may be objects or directories of objects. A missing `dir` has no children.
    ///
    async fn list(&self, dir: &str) -> io::Result<Vec<String>>;

    /// Remove an object, or a directory and every object under it.
    ///
    /// Removing something that doesn't exist is not an error.
    ///
    async fn remove(&self, path: &str) -> io::Result<()>;

    /// Get the size, in bytes, of the object at `path`
    ///
    async fn size_of(&self, path: &str) -> io::Result<Option<u64>>;
}

#[async_trait]
pub trait StoreWrite: AsyncWrite + Unpin + Send {
    /// Close the output stream and publish the newly written object.
    ///
    async fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Join path segments with `/`, ignoring empty segments.
///
pub(crate) fn join(segments: &[&str]) -> String {
    segments
        .iter()
        .filter(|segment| !segment.is_empty())
        .copied()
        .collect::<Vec<&str>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert_eq!(join(&["0", "__fragments", "__1_1_abc"]), "0/__fragments/__1_1_abc");
        assert_eq!(join(&["", "0", "__schema.json"]), "0/__schema.json");
    }
}
