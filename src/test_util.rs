//! Test doubles shared by unit tests.

use crate::connection::Conn;
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::transport::{SendPipeline, Transport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A connection that records every written frame and never yields one on read.
pub(crate) struct RecordingConn {
    sent: Mutex<Vec<Frame>>,
    flushes: AtomicUsize,
}

impl RecordingConn {
    pub fn new() -> Arc<RecordingConn> {
        Arc::new(RecordingConn {
            sent: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
        })
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().unwrap().clone()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn pipeline(conn: &Arc<RecordingConn>) -> Arc<SendPipeline> {
        Arc::new(SendPipeline::new(
            Arc::new(Transport::new(conn.clone())),
            None,
        ))
    }
}

#[async_trait]
impl Conn for RecordingConn {
    async fn read(&self) -> Result<Option<Frame>, ProtocolError> {
        std::future::pending().await
    }

    async fn write(&self, frame: &Frame) -> Result<(), ProtocolError> {
        self.sent.lock().unwrap().push(frame.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), ProtocolError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        Ok(())
    }
}
