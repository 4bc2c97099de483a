// The pluggable backing store consumed by server sessions. Transfers never
// touch the filesystem directly; they go through a FileHandler so a host
// process can serve from disk, memory, or anything else, and can apply
// per-peer policy (the remote address is part of every call).

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// A stream opened for an RRQ. Reads are sequential; `size` reports the
/// total number of bytes the transfer will carry (used to answer tsize=0).
#[async_trait]
pub trait ReadStream: Send {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn size(&self) -> u64;
}

/// A stream opened for a WRQ. Writes are sequential; the stream is closed
/// when dropped.
#[async_trait]
pub trait WriteStream: Send {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
}

/// Opens the backing streams for transfers.
#[async_trait]
pub trait FileHandler: Send + Sync {
    /// Opens `file_name` for an RRQ from `remote_addr`.
    async fn read_file(
        &self,
        remote_addr: SocketAddr,
        file_name: &str,
    ) -> io::Result<Box<dyn ReadStream>>;

    /// Opens `file_name` for a WRQ from `remote_addr`.
    async fn write_file(
        &self,
        remote_addr: SocketAddr,
        file_name: &str,
    ) -> io::Result<Box<dyn WriteStream>>;

    /// Whether `file_name` already exists. Used to answer an RRQ for a
    /// missing file with "file not found" and a WRQ for a present one with
    /// "file already exists".
    async fn is_file_exist(&self, remote_addr: SocketAddr, file_name: &str) -> io::Result<bool>;
}

///////////////////////////////////////////////////////////////
// Filesystem implementation

/// Serves files from a root directory. Requested names are joined to the
/// root after stripping any leading slash, so "/pxe/boot.img" and
/// "pxe/boot.img" name the same file.
pub struct FsHandler {
    root: PathBuf,
}

impl FsHandler {
    pub fn new(root: impl Into<PathBuf>) -> FsHandler {
        FsHandler { root: root.into() }
    }

    fn resolve(&self, file_name: &str) -> PathBuf {
        let trimmed = file_name.strip_prefix('/').unwrap_or(file_name);
        self.root.join(trimmed)
    }
}

struct FsReadStream {
    f: File,
    size: u64,
}

#[async_trait]
impl ReadStream for FsReadStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.f.read(buf).await
    }

    fn size(&self) -> u64 {
        self.size
    }
}

struct FsWriteStream {
    f: File,
}

#[async_trait]
impl WriteStream for FsWriteStream {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        // Flush before the block gets acked; an acked block must not sit in
        // an in-process buffer that a crash would lose.
        self.f.write_all(buf).await?;
        self.f.flush().await
    }
}

#[async_trait]
impl FileHandler for FsHandler {
    async fn read_file(
        &self,
        _remote_addr: SocketAddr,
        file_name: &str,
    ) -> io::Result<Box<dyn ReadStream>> {
        let path = self.resolve(file_name);
        let f = File::open(&path).await?;
        let size = f.metadata().await?.len();
        Ok(Box::new(FsReadStream { f, size }))
    }

    async fn write_file(
        &self,
        _remote_addr: SocketAddr,
        file_name: &str,
    ) -> io::Result<Box<dyn WriteStream>> {
        let path = self.resolve(file_name);
        let f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(Box::new(FsWriteStream { f }))
    }

    async fn is_file_exist(&self, _remote_addr: SocketAddr, file_name: &str) -> io::Result<bool> {
        match tokio::fs::metadata(self.resolve(file_name)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
