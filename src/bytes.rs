use std::{error, fmt};

#[derive(Debug, Clone)]
pub enum Error {
    Truncated,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Truncated => "unexpected end of stream",
        })
    }
}

impl error::Error for Error {}

/// Little-endian reader over a borrowed byte buffer.
#[derive(Debug, Clone)]
pub struct Cursor<'input> {
    buffer: &'input [u8],
    offset: usize,
}

impl<'input> Cursor<'input> {
    #[must_use]
    pub fn new(buffer: &'input [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.offset >= self.buffer.len()
    }

    /// Byte offset of the next read.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        let byte = *self.buffer.get(self.offset).ok_or(Error::Truncated)?;
        self.offset += 1;
        Ok(byte)
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        let end = self.offset + 4;
        let bytes = self
            .buffer
            .get(self.offset..end)
            .ok_or(Error::Truncated)?;
        self.offset = end;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }
}

#[test]
fn test_cursor_reads() {
    let mut c = Cursor::new(&[0x44, 0x14, 0x72, 0x12, 0x2a]);
    assert_eq!(0, c.offset());
    assert_eq!(0x12721444, c.read_u32().unwrap());
    assert_eq!(4, c.offset());
    assert!(!c.is_at_end());
    assert_eq!(0x2a, c.read_u8().unwrap());
    assert!(c.is_at_end());
    assert!(c.read_u8().is_err());
}

#[test]
fn test_cursor_truncated_word() {
    let mut c = Cursor::new(&[1, 2, 3]);
    assert!(c.read_u32().is_err());
    // a failed read consumes nothing
    assert_eq!(0, c.offset());
    assert_eq!(1, c.read_u8().unwrap());
}
