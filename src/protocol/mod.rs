//! Protocol module
//!
//! This module defines the [`Envelope`] exchanged between nodes and the two
//! wire variants that carry it:
//!
//! - **Text** frames: a JSON array whose first element is the kind tag,
//!   compatible with JSON-over-WebSocket device protocols.
//! - **Binary** frames: a compact Protocol Buffers layout.
//!
//! Both variants carry identical logical fields, so an envelope decoded from
//! one variant can be re-encoded in the other by a relay.

mod binary;
mod envelope;
mod text;
mod topology;

pub use binary::BinaryCodec;
pub use envelope::{
    ActionKind, Destination, Envelope, EnvelopeBody, ErrorCode, ErrorDetails, MessageKind,
    Payload, SignatureEntry,
};
pub use text::TextCodec;
pub use topology::{AnnouncedRoute, TopologyAnnouncement};

use crate::error::{DecodeError, ProtocolError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Default payload cap (1 MB)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Room left for routing metadata on top of the payload cap
///
/// Frames larger than `max_payload_size + FRAME_OVERHEAD` are refused before
/// parsing.
pub const FRAME_OVERHEAD: usize = 64 * 1024;

/// Object key marking a raw payload inside a text frame
pub const RAW_PAYLOAD_KEY: &str = "$raw";

/// One message as handed to or received from a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text frame
    Text(String),
    /// Binary frame
    Binary(Vec<u8>),
}

impl Frame {
    /// Size of the frame in bytes
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the frame is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wire variant of the frame
    pub fn format(&self) -> WireFormat {
        match self {
            Self::Text(_) => WireFormat::Text,
            Self::Binary(_) => WireFormat::Binary,
        }
    }
}

/// Wire variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// JSON array frames
    #[default]
    Text,
    /// Protocol Buffers frames
    Binary,
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Binary => f.write_str("binary"),
        }
    }
}

/// Codec limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    /// Largest accepted payload in bytes
    pub max_payload_size: usize,
}

impl CodecConfig {
    /// Largest accepted frame in bytes
    pub fn max_frame_size(&self) -> usize {
        self.max_payload_size.saturating_add(FRAME_OVERHEAD)
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

/// Converts envelopes to and from one wire variant
pub trait EnvelopeCodec: Send + Sync {
    /// Variant handled by this codec
    fn format(&self) -> WireFormat;

    /// Encode an envelope
    fn encode(&self, envelope: &Envelope) -> Result<Frame, ProtocolError>;

    /// Decode a frame
    fn decode(&self, frame: &Frame) -> Result<Envelope, DecodeError>;
}

/// Codec for a wire variant
pub fn codec_for(format: WireFormat, config: CodecConfig) -> Arc<dyn EnvelopeCodec> {
    match format {
        WireFormat::Text => Arc::new(TextCodec::new(config)),
        WireFormat::Binary => Arc::new(BinaryCodec::new(config)),
    }
}

/// Both codecs, selected by frame variant
#[derive(Clone)]
pub struct CodecSet {
    text: Arc<dyn EnvelopeCodec>,
    binary: Arc<dyn EnvelopeCodec>,
}

impl CodecSet {
    /// Codecs sharing one set of limits
    pub fn new(config: CodecConfig) -> Self {
        Self {
            text: codec_for(WireFormat::Text, config),
            binary: codec_for(WireFormat::Binary, config),
        }
    }

    /// Codec for a variant
    pub fn get(&self, format: WireFormat) -> &Arc<dyn EnvelopeCodec> {
        match format {
            WireFormat::Text => &self.text,
            WireFormat::Binary => &self.binary,
        }
    }

    /// Encode for a variant
    pub fn encode(&self, format: WireFormat, envelope: &Envelope) -> Result<Frame, ProtocolError> {
        self.get(format).encode(envelope)
    }

    /// Decode with the codec matching the frame variant
    pub fn decode(&self, frame: &Frame) -> Result<Envelope, DecodeError> {
        self.get(frame.format()).decode(frame)
    }
}

impl Default for CodecSet {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

impl fmt::Debug for CodecSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecSet").finish_non_exhaustive()
    }
}
