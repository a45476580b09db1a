use std::io::{Read, Write};

use anyhow::Error;

/// Largest payload a single pkt-line can carry (65520 bytes total frame
/// minus the 4 byte length header).
pub const MAX_PKT_PAYLOAD: usize = 65516;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid pkt-line length {0:?}")]
    InvalidLength(String),
    #[error("truncated pkt-line")]
    Truncated,
    #[error("unexpected end of filter stream")]
    UnexpectedEof,
    #[error("unexpected packet {got:?} (expected {expected})")]
    UnexpectedPacket { expected: &'static str, got: String },
    #[error("unsupported filter protocol: {0}")]
    Unsupported(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Packet {
    Data(Vec<u8>),
    Flush,
    Delim,
}

/// Reads one side of a pkt-line conversation from a binary stream.
pub struct PktLineReader<R> {
    input: R,
}

impl<R: Read> PktLineReader<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }

    /// Read one packet; `None` on a clean end of stream (EOF before a
    /// length header). EOF anywhere else is a framing error.
    pub fn read_packet(&mut self) -> Result<Option<Packet>, Error> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            match self.input.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(ProtocolError::Truncated.into()),
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        let len = std::str::from_utf8(&header)
            .ok()
            .and_then(|text| usize::from_str_radix(text, 16).ok())
            .ok_or_else(|| {
                ProtocolError::InvalidLength(String::from_utf8_lossy(&header).into_owned())
            })?;

        match len {
            0 => Ok(Some(Packet::Flush)),
            1 => Ok(Some(Packet::Delim)),
            2 | 3 => Err(ProtocolError::InvalidLength(format!("{len:04x}")).into()),
            _ if len > MAX_PKT_PAYLOAD + 4 => {
                Err(ProtocolError::InvalidLength(format!("{len:04x}")).into())
            }
            _ => {
                let mut data = vec![0u8; len - 4];
                self.input.read_exact(&mut data).map_err(|err| {
                    if err.kind() == std::io::ErrorKind::UnexpectedEof {
                        Error::from(ProtocolError::Truncated)
                    } else {
                        err.into()
                    }
                })?;
                Ok(Some(Packet::Data(data)))
            }
        }
    }
}

/// Writes one side of a pkt-line conversation to a binary stream.
pub struct PktLineWriter<W> {
    output: W,
}

impl<W: Write> PktLineWriter<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    /// One text packet; `line` should carry its trailing newline.
    pub fn write_text(&mut self, line: &str) -> std::io::Result<()> {
        debug_assert!(line.len() <= MAX_PKT_PAYLOAD);
        write!(self.output, "{:04x}", line.len() + 4)?;
        self.output.write_all(line.as_bytes())
    }

    /// Payload bytes, split into as many packets as needed.
    pub fn write_data(&mut self, data: &[u8]) -> std::io::Result<()> {
        for part in data.chunks(MAX_PKT_PAYLOAD) {
            write!(self.output, "{:04x}", part.len() + 4)?;
            self.output.write_all(part)?;
        }
        Ok(())
    }

    /// Flush packet. Also flushes the underlying stream, since a flush
    /// always ends a message the peer is waiting for.
    pub fn flush_pkt(&mut self) -> std::io::Result<()> {
        self.output.write_all(b"0000")?;
        self.output.flush()
    }

    pub fn delim_pkt(&mut self) -> std::io::Result<()> {
        self.output.write_all(b"0001")
    }

    /// `Write` adapter that turns a byte stream into full-sized data
    /// packets. Call `finish()` to emit the trailing partial packet.
    pub fn data_writer(&mut self) -> PktDataWriter<'_, W> {
        PktDataWriter {
            writer: self,
            buffer: Vec::with_capacity(MAX_PKT_PAYLOAD),
        }
    }
}

pub struct PktDataWriter<'a, W: Write> {
    writer: &'a mut PktLineWriter<W>,
    buffer: Vec<u8>,
}

impl<W: Write> PktDataWriter<'_, W> {
    fn emit(&mut self) -> std::io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        write!(self.writer.output, "{:04x}", self.buffer.len() + 4)?;
        self.writer.output.write_all(&self.buffer)?;
        self.buffer.clear();
        Ok(())
    }

    pub fn finish(mut self) -> std::io::Result<()> {
        self.emit()
    }
}

impl<W: Write> Write for PktDataWriter<'_, W> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let take = (MAX_PKT_PAYLOAD - self.buffer.len()).min(data.len());
        self.buffer.extend_from_slice(&data[..take]);
        if self.buffer.len() == MAX_PKT_PAYLOAD {
            self.emit()?;
        }
        Ok(take)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.emit()?;
        self.writer.output.flush()
    }
}
