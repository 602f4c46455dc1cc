use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};

use crate::errors::Result;

pub(crate) const NODE_FRAGMENT_META: u8 = 1;
pub(crate) const NODE_CONSOLIDATED_META: u8 = 2;

/// A binary object framed by the resolver's header.
///
#[async_trait]
pub(crate) trait Node: Sized {
    const NODE_TYPE: u8;

    /// Save an object to a stream
    ///
    async fn save_to(&self, stream: &mut (impl AsyncWrite + Unpin + Send)) -> Result<()>;

    /// Load an object from a stream
    async fn load_from(stream: &mut (impl AsyncRead + Unpin + Send)) -> Result<Self>;
}

pub(crate) fn node_type_name(code: u8) -> Option<&'static str> {
    match code {
        NODE_FRAGMENT_META => Some("FragmentMeta"),
        NODE_CONSOLIDATED_META => Some("ConsolidatedMeta"),
        _ => None,
    }
}
