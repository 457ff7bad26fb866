//! side-band-64k multiplexing.
//!
//! Pack bytes and progress text share one response stream; each pkt-line
//! payload is tagged with a leading channel byte so the peer can
//! demultiplex on receipt.

use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::{Result, SyncError};
use std::io::{Read, Write};

/// Maximum payload per side-band-64k frame (65519 minus the channel byte
/// and the 4-byte length prefix accounted by pkt-line).
pub const MAX_SIDE_BAND_PAYLOAD: usize = 65515;

/// Logical channels within one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideBandChannel {
    /// Pack data.
    Pack,
    /// Human-readable progress messages.
    Progress,
    /// Fatal error text.
    Error,
}

impl SideBandChannel {
    fn code(self) -> u8 {
        match self {
            Self::Pack => 1,
            Self::Progress => 2,
            Self::Error => 3,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Pack),
            2 => Ok(Self::Progress),
            3 => Ok(Self::Error),
            other => Err(SyncError::Protocol(format!(
                "unknown side-band channel: {}",
                other
            ))),
        }
    }
}

/// Writes channel-tagged frames over pkt-lines.
pub struct SideBandWriter<W> {
    inner: PktLineWriter<W>,
}

impl<W: Write> SideBandWriter<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        Self {
            inner: PktLineWriter::new(writer),
        }
    }

    /// Writes bytes on a channel, splitting into maximum-size frames.
    pub fn write(&mut self, channel: SideBandChannel, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(MAX_SIDE_BAND_PAYLOAD) {
            let mut frame = Vec::with_capacity(chunk.len() + 1);
            frame.push(channel.code());
            frame.extend_from_slice(chunk);
            self.inner.write_data(&frame)?;
        }
        Ok(())
    }

    /// Writes a progress message (newline appended if missing).
    pub fn progress(&mut self, message: &str) -> Result<()> {
        let mut text = message.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        self.write(SideBandChannel::Progress, text.as_bytes())
    }

    /// Ends the stream with a flush packet.
    pub fn finish(&mut self) -> Result<()> {
        self.inner.flush_pkt()?;
        self.inner.flush()
    }
}

/// Reads channel-tagged frames, used by peers (and tests) to demultiplex.
pub struct SideBandReader<R> {
    inner: PktLineReader<R>,
}

impl<R: Read> SideBandReader<R> {
    /// Wraps a reader.
    pub fn new(reader: R) -> Self {
        Self {
            inner: PktLineReader::new(reader),
        }
    }

    /// Reads the next frame, or None at the terminating flush.
    pub fn read(&mut self) -> Result<Option<(SideBandChannel, Vec<u8>)>> {
        match self.inner.read()? {
            None | Some(PktLine::Flush) => Ok(None),
            Some(PktLine::Delimiter) => {
                Err(SyncError::Protocol("unexpected delimiter in side-band".into()))
            }
            Some(PktLine::Data(data)) => {
                let (&code, payload) = data
                    .split_first()
                    .ok_or_else(|| SyncError::Protocol("empty side-band frame".into()))?;
                Ok(Some((SideBandChannel::from_code(code)?, payload.to_vec())))
            }
        }
    }

    /// Collects the whole stream, concatenating pack bytes and progress
    /// text separately.
    pub fn collect(&mut self) -> Result<(Vec<u8>, String)> {
        let mut pack = Vec::new();
        let mut progress = String::new();
        while let Some((channel, payload)) = self.read()? {
            match channel {
                SideBandChannel::Pack => pack.extend_from_slice(&payload),
                SideBandChannel::Progress => {
                    progress.push_str(&String::from_utf8_lossy(&payload))
                }
                SideBandChannel::Error => {
                    return Err(SyncError::Protocol(format!(
                        "peer error: {}",
                        String::from_utf8_lossy(&payload).trim_end()
                    )));
                }
            }
        }
        Ok((pack, progress))
    }
}
