//! Message framing: `{command, payload_length}` header followed by the payload
//!
//! Header fields are 4-byte native-endian integers. Both peers live on the same
//! host, so no byte-order conversion is done.

use std::io::{ErrorKind, Read, Write};

use launcher_core::{LauncherError, Result};

/// Size of the fixed header in bytes
pub const HEADER_LEN: usize = 8;

/// Largest payload accepted from a peer
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

/// One raw protocol unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: u32, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }

    /// Header plus payload as one buffer
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(LauncherError::Protocol(format!(
                "payload of {} bytes exceeds limit",
                self.payload.len()
            )));
        }
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&self.command.to_ne_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u32).to_ne_bytes());
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Write the frame with a single `write_all` so header and payload stay together
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        let bytes = self.to_bytes()?;
        writer.write_all(&bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Read one frame. `Ok(None)` means the peer closed the stream between frames.
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Frame>> {
        let mut header = [0u8; HEADER_LEN];
        let got = read_full(reader, &mut header)?;
        if got == 0 {
            return Ok(None);
        }
        if got < HEADER_LEN {
            return Err(LauncherError::Protocol(format!(
                "truncated header ({} of {} bytes)",
                got, HEADER_LEN
            )));
        }

        let command = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
        let length = u32::from_ne_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if length > MAX_PAYLOAD_LEN {
            return Err(LauncherError::Protocol(format!(
                "payload length {} exceeds limit",
                length
            )));
        }

        let mut payload = vec![0u8; length];
        let got = read_full(reader, &mut payload)?;
        if got < length {
            return Err(LauncherError::Protocol(format!(
                "truncated payload ({} of {} bytes)",
                got, length
            )));
        }

        Ok(Some(Frame { command, payload }))
    }
}

/// Fill `buf` unless EOF comes first; returns the number of bytes read
fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(LauncherError::Io(e)),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_layout() {
        let bytes = Frame::new(4, vec![1, 2, 3]).to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 3);
        assert_eq!(&bytes[0..4], &4u32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &3u32.to_ne_bytes());
        assert_eq!(&bytes[8..], &[1, 2, 3]);
    }

    #[test]
    fn clean_eof_between_frames() {
        let mut empty = Cursor::new(Vec::new());
        assert!(Frame::read_from(&mut empty).unwrap().is_none());
    }

    #[test]
    fn truncated_header_is_protocol_error() {
        let mut short = Cursor::new(vec![1u8, 0, 0]);
        let err = Frame::read_from(&mut short).unwrap_err();
        assert!(matches!(err, LauncherError::Protocol(_)));
    }

    #[test]
    fn truncated_payload_is_protocol_error() {
        let mut bytes = Frame::new(5, vec![b'x'; 10]).to_bytes().unwrap();
        bytes.truncate(HEADER_LEN + 4);
        let err = Frame::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, LauncherError::Protocol(_)));
    }

    #[test]
    fn oversized_length_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_ne_bytes());
        bytes.extend_from_slice(&((MAX_PAYLOAD_LEN as u32) + 1).to_ne_bytes());
        let err = Frame::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, LauncherError::Protocol(_)));
    }

    #[test]
    fn consecutive_frames() {
        let mut bytes = Frame::new(8, Vec::new()).to_bytes().unwrap();
        bytes.extend(Frame::new(4, vec![9; 8]).to_bytes().unwrap());
        let mut cursor = Cursor::new(bytes);
        assert_eq!(Frame::read_from(&mut cursor).unwrap().unwrap().command, 8);
        assert_eq!(Frame::read_from(&mut cursor).unwrap().unwrap().payload, vec![9; 8]);
        assert!(Frame::read_from(&mut cursor).unwrap().is_none());
    }
}
