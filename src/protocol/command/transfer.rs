//! Payload types for the streaming transfer commands.

use crate::protocol::wire::Map;
use crate::protocol::ProtocolError;

use super::ReplyBody;

/// Chunk size for streaming transfers and chunked copies.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// The initial `pull` response, announcing the stream that follows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullHeader {
    /// Total bytes the data stream will carry.
    pub size: u64,
    /// Permission bits of the source file.
    pub mode: u32,
}

impl ReplyBody for PullHeader {
    fn to_map(&self) -> Map {
        let mut m = Map::new();
        m.insert("size", self.size);
        m.insert("mode", self.mode);
        m
    }

    fn from_map(map: &Map) -> Result<Self, ProtocolError> {
        Ok(PullHeader {
            size: map.uint("size"),
            mode: map.uint32("mode")?,
        })
    }
}
