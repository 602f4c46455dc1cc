//! Extend AsyncRead and AsyncWrite with some convenience methods for binary i/o
//!
use std::io;

use async_trait::async_trait;
use futures::{io as aio, AsyncReadExt, AsyncWriteExt};
use unsigned_varint::{
    aio::read_u64 as varint_read_u64,
    encode::{u64 as varint_encode_u64, u64_buffer as varint_u64_buffer},
    io::ReadError,
};

#[async_trait]
pub(crate) trait ExtendedAsyncRead: aio::AsyncRead {
    /// Read a byte from a stream
    async fn read_byte(&mut self) -> io::Result<u8>;

    /// Read a Big Endian encoded 16 bit unsigned integer from a stream
    async fn read_u16(&mut self) -> io::Result<u16>;

    /// Read a Big Endian encoded 32 bit unsigned integer from a stream
    async fn read_u32(&mut self) -> io::Result<u32>;

    /// Read a Big Endian encoded 64 bit unsigned integer from a stream
    async fn read_u64(&mut self) -> io::Result<u64>;

    /// Read an unsigned varint from a stream
    async fn read_varint(&mut self) -> io::Result<u64>;

    /// Read a varint length prefixed byte string from a stream
    async fn read_bytes(&mut self) -> io::Result<Vec<u8>>;
}

#[async_trait]
impl<R: aio::AsyncRead + Unpin + Send> ExtendedAsyncRead for R {
    async fn read_byte(&mut self) -> io::Result<u8> {
        let mut buffer = [0; 1];
        self.read_exact(&mut buffer).await?;

        Ok(buffer[0])
    }

    async fn read_u16(&mut self) -> io::Result<u16> {
        let mut buffer = [0; 2];
        self.read_exact(&mut buffer).await?;

        Ok(u16::from_be_bytes(buffer))
    }

    async fn read_u32(&mut self) -> io::Result<u32> {
        let mut buffer = [0; 4];
        self.read_exact(&mut buffer).await?;

        Ok(u32::from_be_bytes(buffer))
    }

    async fn read_u64(&mut self) -> io::Result<u64> {
        let mut buffer = [0; 8];
        self.read_exact(&mut buffer).await?;

        Ok(u64::from_be_bytes(buffer))
    }

    async fn read_varint(&mut self) -> io::Result<u64> {
        varint_read_u64(&mut *self).await.map_err(|err| match err {
            ReadError::Io(err) => err,
            err => io::Error::new(io::ErrorKind::InvalidData, err.to_string()),
        })
    }

    async fn read_bytes(&mut self) -> io::Result<Vec<u8>> {
        let len = self.read_varint().await?;
        let mut bytes = Vec::new();
        self.take(len).read_to_end(&mut bytes).await?;
        if bytes.len() as u64 != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "byte string truncated",
            ));
        }

        Ok(bytes)
    }
}

#[async_trait]
pub(crate) trait ExtendedAsyncWrite: aio::AsyncWrite {
    /// Write a byte to a stream
    async fn write_byte(&mut self, byte: u8) -> io::Result<()>;

    /// Write a Big Endian encoded 16 bit unsigned integer to a stream
    async fn write_u16(&mut self, word: u16) -> io::Result<()>;

    /// Write a Big Endian encoded 32 bit unsigned integer to a stream
    async fn write_u32(&mut self, word: u32) -> io::Result<()>;

    /// Write a Big Endian encoded 64 bit unsigned integer to a stream
    async fn write_u64(&mut self, word: u64) -> io::Result<()>;

    /// Write an unsigned varint to a stream
    async fn write_varint(&mut self, word: u64) -> io::Result<()>;

    /// Write a varint length prefixed byte string to a stream
    async fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;
}

#[async_trait]
impl<W: aio::AsyncWrite + Unpin + Send> ExtendedAsyncWrite for W {
    async fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        let buffer = [byte];
        self.write_all(&buffer).await?;

        Ok(())
    }

    async fn write_u16(&mut self, word: u16) -> io::Result<()> {
        let buffer = word.to_be_bytes();
        self.write_all(&buffer).await?;

        Ok(())
    }

    async fn write_u32(&mut self, word: u32) -> io::Result<()> {
        let buffer = word.to_be_bytes();
        self.write_all(&buffer).await?;

        Ok(())
    }

    async fn write_u64(&mut self, word: u64) -> io::Result<()> {
        let buffer = word.to_be_bytes();
        self.write_all(&buffer).await?;

        Ok(())
    }

    async fn write_varint(&mut self, word: u64) -> io::Result<()> {
        let mut buffer = varint_u64_buffer();
        let encoded = varint_encode_u64(word, &mut buffer);
        self.write_all(encoded).await?;

        Ok(())
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_varint(bytes.len() as u64).await?;
        self.write_all(bytes).await?;

        Ok(())
    }
}
