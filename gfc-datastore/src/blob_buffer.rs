use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Error};

/// Holds one inbound or outbound blob, in RAM or spilled to disk.
///
/// The buffer is write-once, read-many: a request's payload is appended
/// packet by packet, then streamed out (possibly several times). The
/// disk form uses an anonymous temp file inside the repository's git
/// directory; it is created unlinked, so no exit path can leak it.
pub enum BlobBuffer {
    Memory(Vec<u8>),
    Disk { file: File, len: u64 },
}

impl BlobBuffer {
    pub fn in_memory() -> Self {
        BlobBuffer::Memory(Vec::new())
    }

    pub fn on_disk(tmp_dir: &Path) -> Result<Self, Error> {
        let file = tempfile::tempfile_in(tmp_dir)
            .with_context(|| format!("unable to create blob spill file in {tmp_dir:?}"))?;
        Ok(BlobBuffer::Disk { file, len: 0 })
    }

    pub fn with_mode(ondisk: bool, tmp_dir: &Path) -> Result<Self, Error> {
        if ondisk {
            Self::on_disk(tmp_dir)
        } else {
            Ok(Self::in_memory())
        }
    }

    pub fn append(&mut self, data: &[u8]) -> Result<(), Error> {
        match self {
            BlobBuffer::Memory(buf) => buf.extend_from_slice(data),
            BlobBuffer::Disk { file, len } => {
                file.write_all(data).context("blob spill file write failed")?;
                *len += data.len() as u64;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> u64 {
        match self {
            BlobBuffer::Memory(buf) => buf.len() as u64,
            BlobBuffer::Disk { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewind and stream the accumulated bytes. May be called repeatedly.
    pub fn reader(&mut self) -> Result<BlobReader<'_>, Error> {
        match self {
            BlobBuffer::Memory(buf) => Ok(BlobReader::Memory(&buf[..])),
            BlobBuffer::Disk { file, .. } => {
                file.seek(SeekFrom::Start(0))
                    .context("blob spill file rewind failed")?;
                Ok(BlobReader::Disk(file))
            }
        }
    }

    /// Materialize the whole blob. Callers should prefer `reader()`.
    pub fn read_all(&mut self) -> Result<Vec<u8>, Error> {
        let mut data = Vec::with_capacity(self.len() as usize);
        self.reader()?.read_to_end(&mut data)?;
        Ok(data)
    }
}

pub enum BlobReader<'a> {
    Memory(&'a [u8]),
    Disk(&'a mut File),
}

impl Read for BlobReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            BlobReader::Memory(slice) => slice.read(buf),
            BlobReader::Disk(file) => file.read(buf),
        }
    }
}
