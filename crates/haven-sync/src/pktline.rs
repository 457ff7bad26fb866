//! pkt-line framing.
//!
//! Every protocol line is prefixed with a 4-hex-digit length covering the
//! prefix itself, with `0000` reserved as a flush marker.

use crate::{Result, SyncError};
use std::io::{Read, Write};

/// Largest payload a 4-hex-digit length prefix can frame.
pub const MAX_PKT_PAYLOAD: usize = 0xffff - 4;

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Data line with payload.
    Data(Vec<u8>),
    /// Flush packet (`0000`).
    Flush,
    /// Delimiter packet (`0001`).
    Delimiter,
}

impl PktLine {
    /// Creates a data packet from a string.
    pub fn text(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    /// Encodes the packet into wire bytes. Payloads beyond
    /// [`MAX_PKT_PAYLOAD`] cannot be framed and are rejected.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Data(data) => {
                if data.len() > MAX_PKT_PAYLOAD {
                    return Err(SyncError::InvalidPktLine(format!(
                        "payload of {} bytes exceeds frame limit",
                        data.len()
                    )));
                }
                let mut out = format!("{:04x}", data.len() + 4).into_bytes();
                out.extend_from_slice(data);
                Ok(out)
            }
            Self::Flush => Ok(b"0000".to_vec()),
            Self::Delimiter => Ok(b"0001".to_vec()),
        }
    }

    /// Returns the payload, or None for control packets.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the payload as text with any trailing newline trimmed.
    pub fn as_text(&self) -> Option<&str> {
        self.data()
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(|s| s.trim_end_matches('\n'))
    }
}

/// Reads pkt-line packets from a byte stream.
pub struct PktLineReader<R> {
    reader: R,
}

impl<R: Read> PktLineReader<R> {
    /// Wraps a reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next packet, or None at end of stream.
    pub fn read(&mut self) -> Result<Option<PktLine>> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len_str = std::str::from_utf8(&len_buf)
            .map_err(|_| SyncError::InvalidPktLine("non-ascii length prefix".into()))?;
        match len_str {
            "0000" => Ok(Some(PktLine::Flush)),
            "0001" => Ok(Some(PktLine::Delimiter)),
            _ => {
                let len = usize::from_str_radix(len_str, 16)
                    .map_err(|_| SyncError::InvalidPktLine(format!("bad length: {}", len_str)))?;
                if len < 4 {
                    return Err(SyncError::InvalidPktLine(format!(
                        "length {} below minimum",
                        len
                    )));
                }
                let mut data = vec![0u8; len - 4];
                self.reader.read_exact(&mut data)?;
                Ok(Some(PktLine::Data(data)))
            }
        }
    }

    /// Unwraps the inner reader. Nothing is buffered, so the stream can
    /// switch framing mid-flight (pkt-lines followed by side-band).
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Reads packets up to (and consuming) the next flush.
    pub fn read_until_flush(&mut self) -> Result<Vec<PktLine>> {
        let mut packets = Vec::new();
        loop {
            match self.read()? {
                Some(PktLine::Flush) | None => return Ok(packets),
                Some(pkt) => packets.push(pkt),
            }
        }
    }
}

/// Writes pkt-line packets to a byte stream.
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes one packet.
    pub fn write(&mut self, pkt: &PktLine) -> Result<()> {
        self.writer.write_all(&pkt.encode()?)?;
        Ok(())
    }

    /// Writes a data packet.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.write(&PktLine::Data(data.to_vec()))
    }

    /// Writes a text line, ensuring a trailing newline.
    pub fn write_line(&mut self, s: &str) -> Result<()> {
        let mut data = s.as_bytes().to_vec();
        if !s.ends_with('\n') {
            data.push(b'\n');
        }
        self.write(&PktLine::Data(data))
    }

    /// Writes a flush packet.
    pub fn flush_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Flush)
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Returns a mutable reference to the underlying writer.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode() {
        assert_eq!(PktLine::text("hello\n").encode().unwrap(), b"000ahello\n");
        assert_eq!(PktLine::Flush.encode().unwrap(), b"0000");
        assert_eq!(PktLine::Delimiter.encode().unwrap(), b"0001");
        assert_eq!(PktLine::Data(Vec::new()).encode().unwrap(), b"0004");
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let pkt = PktLine::Data(vec![0u8; MAX_PKT_PAYLOAD + 1]);
        assert!(matches!(pkt.encode(), Err(SyncError::InvalidPktLine(_))));

        let mut writer = PktLineWriter::new(Vec::new());
        assert!(writer.write(&pkt).is_err());

        // The limit itself still frames, as `ffff`.
        let max = PktLine::Data(vec![0u8; MAX_PKT_PAYLOAD]);
        assert!(max.encode().unwrap().starts_with(b"ffff"));
    }

    #[test]
    fn test_roundtrip() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_line("want aabb").unwrap();
            writer.write_data(b"binary\x00payload").unwrap();
            writer.flush_pkt().unwrap();
        }

        let mut reader = PktLineReader::new(Cursor::new(buf));
        assert_eq!(
            reader.read().unwrap().unwrap().as_text(),
            Some("want aabb")
        );
        assert_eq!(
            reader.read().unwrap().unwrap().data(),
            Some(b"binary\x00payload".as_slice())
        );
        assert_eq!(reader.read().unwrap(), Some(PktLine::Flush));
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn test_read_until_flush() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_line("one").unwrap();
            writer.write_line("two").unwrap();
            writer.flush_pkt().unwrap();
            writer.write_line("three").unwrap();
        }
        let mut reader = PktLineReader::new(Cursor::new(buf));
        assert_eq!(reader.read_until_flush().unwrap().len(), 2);
    }

    #[test]
    fn test_length_below_minimum() {
        let mut reader = PktLineReader::new(Cursor::new(b"0003".to_vec()));
        assert!(matches!(
            reader.read(),
            Err(SyncError::InvalidPktLine(_))
        ));
    }

    #[test]
    fn test_non_hex_length() {
        let mut reader = PktLineReader::new(Cursor::new(b"zzzz".to_vec()));
        assert!(reader.read().is_err());
    }

    #[test]
    fn test_large_payload() {
        let payload = vec![0xabu8; 60000];
        let encoded = PktLine::Data(payload.clone()).encode().unwrap();
        let mut reader = PktLineReader::new(Cursor::new(encoded));
        assert_eq!(reader.read().unwrap().unwrap().data(), Some(&payload[..]));
    }

    #[test]
    fn test_as_text_invalid_utf8() {
        assert!(PktLine::Data(vec![0xff, 0xfe]).as_text().is_none());
        assert!(PktLine::Flush.as_text().is_none());
    }
}
