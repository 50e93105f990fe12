//! Length-prefixed packet framing.
//!
//! Each frame on the wire is a 4-byte big-endian payload length followed by
//! the packet payload. A stream that ends mid-frame surfaces as a connection
//! error from the reactor; the decoder itself just waits for more input.
use thiserror::Error;

use dexd_types::messages::p2p::DecodeError;
use dexd_types::Packet;

/// Frames larger than this are rejected outright.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Length of the frame length prefix.
const PREFIX_SIZE: usize = 4;

/// An error decoding a peer's byte stream.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),
    #[error(transparent)]
    Malformed(#[from] DecodeError),
}

/// Frame stream decoder.
///
/// Turns a byte stream into packets.
#[derive(Debug)]
pub struct Framer {
    unparsed: Vec<u8>,
}

impl Framer {
    /// Create a new stream decoder.
    pub fn new(capacity: usize) -> Self {
        Self {
            unparsed: Vec::with_capacity(capacity),
        }
    }

    /// Input bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Decode and return the next packet. Returns [`None`] if a full frame
    /// hasn't arrived yet.
    pub fn decode_next(&mut self) -> Result<Option<Packet>, FrameError> {
        if self.unparsed.len() < PREFIX_SIZE {
            return Ok(None);
        }
        let prefix: [u8; PREFIX_SIZE] = self.unparsed[..PREFIX_SIZE]
            .try_into()
            .expect("slice length matches");
        let length = u32::from_be_bytes(prefix) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }
        if self.unparsed.len() < PREFIX_SIZE + length {
            return Ok(None);
        }

        let packet = Packet::from_bytes(&self.unparsed[PREFIX_SIZE..PREFIX_SIZE + length])?;
        self.unparsed.drain(..PREFIX_SIZE + length);

        Ok(Some(packet))
    }

    /// Encode a packet as a frame.
    pub fn frame(packet: &Packet) -> Vec<u8> {
        let payload = packet.to_bytes();
        let mut buf = Vec::with_capacity(PREFIX_SIZE + payload.len());

        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dexd_types::PacketBody;

    #[test]
    fn decodes_frames_fed_byte_by_byte() {
        let ping = Packet::new(PacketBody::Ping);
        let pong = Packet::response(PacketBody::Pong, ping.header.id);

        let mut stream = Framer::frame(&ping);
        stream.extend_from_slice(&Framer::frame(&pong));

        let mut framer = Framer::new(64);
        let mut decoded = Vec::new();

        for byte in stream {
            framer.input(&[byte]);
            while let Some(packet) = framer.decode_next().unwrap() {
                decoded.push(packet);
            }
        }

        assert_eq!(decoded, vec![ping, pong]);
    }

    #[test]
    fn waits_for_partial_frames() {
        let frame = Framer::frame(&Packet::new(PacketBody::GetNodes));
        let mut framer = Framer::new(64);

        framer.input(&frame[..frame.len() - 1]);
        assert!(framer.decode_next().unwrap().is_none());

        framer.input(&frame[frame.len() - 1..]);
        assert!(framer.decode_next().unwrap().is_some());
    }

    #[test]
    fn rejects_oversized_frames() {
        let mut framer = Framer::new(64);
        framer.input(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());

        assert!(matches!(
            framer.decode_next(),
            Err(FrameError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn rejects_malformed_payloads() {
        let mut framer = Framer::new(64);
        framer.input(&3u32.to_be_bytes());
        framer.input(&[0xfe, 0x01, 0x02]);

        assert!(matches!(
            framer.decode_next(),
            Err(FrameError::Malformed(_))
        ));
    }
}
