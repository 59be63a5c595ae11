//! Framed connections: the byte-stream adaptor underneath the transport.
//!
//! On stream transports every frame is prefixed by its 24-bit big-endian length. A
//!  `FramedConn` owns both halves of a byte stream, keeps exactly one reader at a time
//!  and serializes writers behind an internal lock; `flush` commits everything written
//!  before it was called.

use crate::buf_ext::BufMutExt;
use crate::buffers::frame_pool::FrameBufferPool;
use crate::error::{FrameError, ProtocolError};
use crate::frame::Frame;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, DuplexStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Length of the outer frame length prefix.
pub const FRAME_LENGTH_PREFIX_LEN: usize = 3;
/// The length prefix is 24 bits, so no frame can exceed this.
pub const MAX_FRAME_LEN_LIMIT: usize = 0x00ff_ffff;

/// A connection carrying whole frames over a reliable byte stream.
///
/// There is exactly one reader (the transport's read loop); writes from any number of
///  tasks are serialized internally. `close` is idempotent, and readers racing with it
///  observe end-of-stream.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Conn: Send + Sync + 'static {
    /// Reads the next frame. `Ok(None)` means the peer closed the stream cleanly at a
    ///  frame boundary.
    async fn read(&self) -> Result<Option<Frame>, ProtocolError>;

    /// Buffers one encoded frame for sending.
    async fn write(&self, frame: &Frame) -> Result<(), ProtocolError>;

    /// Commits all writes buffered before this call.
    async fn flush(&self) -> Result<(), ProtocolError>;

    async fn close(&self) -> Result<(), ProtocolError>;
}

pub struct FramedConn<R, W> {
    reader: Mutex<R>,
    writer: Mutex<BufWriter<W>>,
    pool: FrameBufferPool,
    max_frame_len: usize,
    closed: AtomicBool,
}

impl<R, W> FramedConn<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W, max_frame_len: usize, pool_size: usize) -> FramedConn<R, W> {
        FramedConn {
            reader: Mutex::new(reader),
            writer: Mutex::new(BufWriter::new(writer)),
            pool: FrameBufferPool::new(1024, pool_size),
            max_frame_len: max_frame_len.min(MAX_FRAME_LEN_LIMIT),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<R, W> Conn for FramedConn<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn read(&self) -> Result<Option<Frame>, ProtocolError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut reader = self.reader.lock().await;

        let mut len_buf = [0u8; FRAME_LENGTH_PREFIX_LEN];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            // EOF at a frame boundary is a clean shutdown
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let frame_len = u32::from_be_bytes([0, len_buf[0], len_buf[1], len_buf[2]]) as usize;
        if frame_len > self.max_frame_len {
            return Err(ProtocolError::Invalid(format!(
                "peer announced a frame of {} bytes, limit is {} - closing because the stream is apparently corrupt",
                frame_len, self.max_frame_len
            )));
        }

        let mut frame_buf = vec![0u8; frame_len];
        match reader.read_exact(&mut frame_buf).await {
            Ok(_) => {}
            // EOF inside a frame is truncation, not a clean shutdown
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::Incomplete.into())
            }
            Err(e) => return Err(e.into()),
        }
        trace!("read frame of {} bytes", frame_len);

        let frame = Frame::deser(Bytes::from(frame_buf))?;
        Ok(Some(frame))
    }

    async fn write(&self, frame: &Frame) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::TransportClosed);
        }
        let encoded_len = frame.encoded_len();
        if encoded_len > self.max_frame_len {
            return Err(ProtocolError::Invalid(format!(
                "frame of {} bytes exceeds the maximum frame length of {}",
                encoded_len, self.max_frame_len
            )));
        }

        let mut buf = self.pool.get_from_pool();
        buf.put_u24(encoded_len as u32);
        frame.ser(&mut buf);

        let result = {
            let mut writer = self.writer.lock().await;
            writer.write_all(&buf).await
        };
        self.pool.return_to_pool(buf);
        result.map_err(Into::into)
    }

    async fn flush(&self) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::TransportClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.flush().await.map_err(Into::into)
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("closing connection");
        let mut writer = self.writer.lock().await;
        let _ = writer.flush().await;
        let _ = writer.shutdown().await;
        Ok(())
    }
}

/// TCP rendition of the framed connection.
pub type TcpConn = FramedConn<BufReader<OwnedReadHalf>, OwnedWriteHalf>;

impl TcpConn {
    pub fn from_stream(stream: TcpStream, max_frame_len: usize, pool_size: usize) -> TcpConn {
        let (read_half, write_half) = stream.into_split();
        FramedConn::new(BufReader::new(read_half), write_half, max_frame_len, pool_size)
    }

    pub async fn connect(
        addr: impl ToSocketAddrs,
        max_frame_len: usize,
        pool_size: usize,
    ) -> anyhow::Result<TcpConn> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(TcpConn::from_stream(stream, max_frame_len, pool_size))
    }
}

/// An in-memory connection pair, mostly for tests: frames written to one end are read
///  from the other.
pub type PipeConn =
    FramedConn<tokio::io::ReadHalf<DuplexStream>, tokio::io::WriteHalf<DuplexStream>>;

pub fn pipe(max_frame_len: usize) -> (PipeConn, PipeConn) {
    let (a, b) = tokio::io::duplex(1024 * 1024);
    let (read_a, write_a) = tokio::io::split(a);
    let (read_b, write_b) = tokio::io::split(b);
    (
        FramedConn::new(read_a, write_a, max_frame_len, 16),
        FramedConn::new(read_b, write_b, max_frame_len, 16),
    )
}
