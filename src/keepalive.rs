//! Keepalive scheduling. The session sends `KEEPALIVE{RESPOND}` every interval,
//!  carrying the position of the last received stream bytes; the echo path (replying
//!  with RESPOND cleared) lives in the session's keepalive handler. Liveness is
//!  enforced by the transport's read deadline: no frame for `max_lifetime` kills the
//!  connection.

use crate::error::ProtocolError;
use crate::frame::{Frame, KeepaliveFrame};
use crate::resume::ResumeBuffer;
use crate::transport::{SendPipeline, Transport};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::trace;

/// Runs until sending fails (i.e. the connection died). Each tick also trims the
///  resume buffer by whatever the peer has acknowledged since.
pub(crate) async fn run_keepalive(
    pipeline: Arc<SendPipeline>,
    transport: Arc<Transport>,
    resume: Option<Arc<ResumeBuffer>>,
    interval: Duration,
) -> Result<(), ProtocolError> {
    let mut ticks = time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the immediate first tick doubles as the post-handshake hello
    loop {
        ticks.tick().await;

        if let Some(resume) = &resume {
            resume.trim(transport.peer_ack_position());
        }

        let frame = Frame::Keepalive(KeepaliveFrame {
            respond: true,
            last_received_position: transport.position_received(),
            data: Bytes::new(),
        });
        trace!("sending keepalive");
        pipeline.send(frame, true).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RecordingConn;

    #[tokio::test]
    async fn test_keepalives_carry_received_position() {
        let conn = RecordingConn::new();
        let pipeline = RecordingConn::pipeline(&conn);
        let transport = pipeline.transport().clone();
        transport.restore_position_received(99);

        let task = tokio::spawn(run_keepalive(
            pipeline,
            transport,
            None,
            Duration::from_millis(10),
        ));
        tokio::time::sleep(Duration::from_millis(35)).await;
        task.abort();

        let sent = conn.sent();
        assert!(sent.len() >= 2, "expected several keepalives, got {}", sent.len());
        for frame in sent {
            match frame {
                Frame::Keepalive(ka) => {
                    assert!(ka.respond);
                    assert_eq!(99, ka.last_received_position);
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }
}
