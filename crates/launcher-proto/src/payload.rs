//! Field-level payload encoding: 8-byte native-endian integers and NUL-terminated strings

use launcher_core::{LauncherError, Result};

const LONG_LEN: usize = 8;

/// Appends fields to a payload buffer
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_long(&mut self, value: i64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_ne_bytes());
        self
    }

    /// Append a NUL-terminated string. Interior NUL bytes cannot be represented.
    pub fn put_str(&mut self, value: &str) -> Result<&mut Self> {
        if value.as_bytes().contains(&0) {
            return Err(LauncherError::Protocol(format!(
                "string field contains NUL byte: {:?}",
                value
            )));
        }
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        Ok(self)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Consumes fields from a payload in a fixed order
#[derive(Debug)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn get_long(&mut self) -> Result<i64> {
        if self.remaining() < LONG_LEN {
            return Err(LauncherError::Protocol(format!(
                "integer field at offset {} runs past end of payload",
                self.pos
            )));
        }
        let mut raw = [0u8; LONG_LEN];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + LONG_LEN]);
        self.pos += LONG_LEN;
        Ok(i64::from_ne_bytes(raw))
    }

    pub fn get_str(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let Some(nul) = rest.iter().position(|&b| b == 0) else {
            return Err(LauncherError::Protocol(format!(
                "unterminated string at offset {}",
                self.pos
            )));
        };
        let value = String::from_utf8(rest[..nul].to_vec()).map_err(|_| {
            LauncherError::Protocol(format!("string at offset {} is not UTF-8", self.pos))
        })?;
        self.pos += nul + 1;
        Ok(value)
    }

    /// Require that every byte has been consumed
    pub fn finish(self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(LauncherError::Protocol(format!(
                "{} trailing bytes after last field",
                self.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_in_order() {
        let mut writer = PayloadWriter::new();
        writer.put_long(2);
        writer.put_str("echo").unwrap();
        writer.put_str("").unwrap();
        let payload = writer.finish();

        let mut reader = PayloadReader::new(&payload);
        assert_eq!(reader.get_long().unwrap(), 2);
        assert_eq!(reader.get_str().unwrap(), "echo");
        assert_eq!(reader.get_str().unwrap(), "");
        reader.finish().unwrap();
    }

    #[test]
    fn rejects_interior_nul() {
        let mut writer = PayloadWriter::new();
        assert!(writer.put_str("a\0b").is_err());
    }

    #[test]
    fn short_integer_is_error() {
        let mut reader = PayloadReader::new(&[1, 2, 3]);
        assert!(reader.get_long().is_err());
    }

    #[test]
    fn unterminated_string_is_error() {
        let mut reader = PayloadReader::new(b"abc");
        assert!(reader.get_str().is_err());
    }

    #[test]
    fn trailing_bytes_fail_finish() {
        let reader = PayloadReader::new(&[0]);
        assert!(reader.finish().is_err());
    }
}
