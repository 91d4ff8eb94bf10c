//! Remote sources that files are synchronized from.
//!
//! A [`RemoteSource`] hands out [`RemoteConnection`]s. The transfer pool owns
//! connections exclusively while an attempt runs and throws a connection away
//! after a transient failure, so implementations never have to recover a
//! broken session themselves.

mod local;
mod memory;

pub use local::LocalDirSource;
pub use memory::{FetchHold, MemoryRemote};

use crate::error::TransferError;
use crate::models::RemoteEntry;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Body of a fetched file, yielded in chunks.
pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, TransferError>>;

/// Factory for connections to one remote.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// Open a new connection.
    async fn connect(&self) -> std::result::Result<Box<dyn RemoteConnection>, TransferError>;
}

/// One session with a remote. Used by a single task at a time.
#[async_trait]
pub trait RemoteConnection: Send {
    /// List entries under `path`. With `recursive`, subdirectories are expanded
    /// and reported alongside the files they contain.
    async fn list(
        &mut self,
        path: &str,
        recursive: bool,
    ) -> std::result::Result<Vec<RemoteEntry>, TransferError>;

    /// Stream the contents of the file at `path`.
    async fn fetch(&mut self, path: &str) -> std::result::Result<ByteStream, TransferError>;
}
