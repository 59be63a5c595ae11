use anyhow::bail;
use bytes::Bytes;
use std::time::Duration;

/// Maximum length of a resume token on the wire (u16 length prefix).
pub const MAX_RESUME_TOKEN_LEN: usize = 65535;

/// Configuration for one session (one connection).
///
/// The keepalive parameters are advertised to the peer in the SETUP frame: the server
///  adopts the client's `max_lifetime` as its read deadline, the client keeps its own
///  configured value.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between outbound KEEPALIVE frames.
    pub keepalive_interval: Duration,

    /// If no frame at all arrives for this long, the connection is considered dead and
    ///  is closed. Should be a small multiple of the peer's keepalive interval to
    ///  tolerate lost or delayed keepalives.
    pub max_lifetime: Duration,

    /// MIME type of payload metadata, advertised in SETUP.
    pub metadata_mime_type: String,

    /// MIME type of payload data, advertised in SETUP.
    pub data_mime_type: String,

    /// Outbound fragmentation threshold in bytes: payloads whose metadata + data exceed
    ///  this are split across FOLLOWS frames. 0 disables outbound fragmentation.
    ///
    /// NB: This bounds the *payload* portion; the frame header and length prefix come
    ///  on top. Inbound reassembly works regardless of this setting.
    pub frame_mtu: usize,

    /// Maximum accepted length of a single inbound frame. A peer announcing a longer
    ///  frame gets the connection closed - an oversized length prefix is
    ///  indistinguishable from stream corruption.
    pub max_frame_len: usize,

    /// Whether requests on this session are subject to lease admission. Effective only
    ///  when both sides advertised it during setup.
    pub lease: bool,

    /// Resume token to advertise in SETUP. `Some` enables resumption support and
    ///  retention of sent frames in the resume buffer.
    pub resume_token: Option<Bytes>,

    /// Upper bound in bytes for the resume send-buffer. Oldest frames are dropped once
    ///  the buffer grows beyond this, moving the first available resume position forward.
    pub resume_window: usize,

    /// Number of pooled frame-encode buffers.
    pub buffer_pool_size: usize,
}

impl SessionConfig {
    pub fn default_client() -> SessionConfig {
        SessionConfig {
            keepalive_interval: Duration::from_secs(20),
            max_lifetime: Duration::from_secs(90),
            metadata_mime_type: "application/binary".to_string(),
            data_mime_type: "application/binary".to_string(),
            frame_mtu: 0,
            max_frame_len: 16 * 1024 * 1024,
            lease: false,
            resume_token: None,
            resume_window: 1024 * 1024,
            buffer_pool_size: 256,
        }
    }

    pub fn default_server() -> SessionConfig {
        // the server's keepalive parameters are overridden by the client's SETUP frame
        SessionConfig::default_client()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.keepalive_interval < Duration::from_millis(1) {
            bail!("keepalive interval must be at least 1ms");
        }
        if self.max_lifetime < self.keepalive_interval {
            bail!("max lifetime must not be smaller than the keepalive interval");
        }
        if self.max_lifetime > Duration::from_millis(u32::MAX as u64) {
            bail!("max lifetime does not fit the wire representation (u32 millis)");
        }
        if self.max_frame_len < 64 {
            bail!("max frame length is too small to hold a frame header");
        }
        if self.frame_mtu != 0 && self.frame_mtu < 64 {
            bail!("frame MTU is too small to make progress on fragmented payloads");
        }
        if let Some(token) = &self.resume_token {
            if token.len() > MAX_RESUME_TOKEN_LEN {
                bail!("resume token exceeds the maximum length of {} bytes", MAX_RESUME_TOKEN_LEN);
            }
            if token.is_empty() {
                bail!("resume token must not be empty");
            }
        }
        Ok(())
    }
}
