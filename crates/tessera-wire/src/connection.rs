use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use tessera_types::Error;

use crate::frame::Frame;

/// A TCP stream speaking [`Frame`]s.
///
/// Bytes read past the end of a frame stay buffered for the next call, which
/// lets the multiplexer hand over a connection it has already read from.
pub struct Connection {
    stream: TcpStream,
    buffer: BytesMut,
    max_frame_bytes: usize,
}

impl Connection {
    pub fn new(stream: TcpStream, max_frame_bytes: usize) -> Self {
        Self::with_buffer(stream, BytesMut::with_capacity(8 * 1024), max_frame_bytes)
    }

    pub fn with_buffer(stream: TcpStream, buffer: BytesMut, max_frame_bytes: usize) -> Self {
        Connection { stream, buffer, max_frame_bytes }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.stream.peer_addr()?)
    }

    /// Read the next frame. `Ok(None)` means the peer closed cleanly between
    /// frames.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buffer, self.max_frame_bytes)? {
                return Ok(Some(frame));
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Network("connection reset mid-frame".into()));
            }
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        let mut out = BytesMut::with_capacity(frame.encoded_len());
        frame.encode(&mut out);
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send an error frame and close the write half.
    pub async fn reject(mut self, message: &str) -> Result<(), Error> {
        self.write_frame(&Frame::error(message)).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}
