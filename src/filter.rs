use std::io::{BufReader, Read, Write};
use std::path::PathBuf;

use anyhow::{bail, format_err, Context, Error};

use gfc_datastore::manifest::MANIFEST_MAGIC;
use gfc_datastore::{BlobBuffer, ChunkStorage, ChunkStream, Chunker, FilterConfig, Manifest};

use crate::pktline::{Packet, PktLineReader, PktLineWriter, ProtocolError};

/// Session counters, logged once at session end.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub requests: usize,
    pub cleans: usize,
    pub smudges: usize,
    pub chunks: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

struct Request {
    command: String,
    pathname: String,
}

/// Long-running clean/smudge filter driver.
///
/// One instance serves every file of a git invocation over a single pair
/// of pipes (git's long-running filter process protocol, version 2).
/// Requests are handled strictly in arrival order; failing requests are
/// answered with an error status and the session continues. Closing the
/// input stream ends the session and triggers the one side-branch commit
/// covering everything cleaned since startup.
pub struct FilterDriver<R, W, S> {
    input: PktLineReader<R>,
    output: PktLineWriter<W>,
    store: S,
    chunker: Chunker,
    ondisk: bool,
    tmp_dir: PathBuf,
    stats: SessionStats,
}

impl<R: Read, W: Write, S: ChunkStorage> FilterDriver<R, W, S> {
    pub fn new(
        input: R,
        output: W,
        store: S,
        config: &FilterConfig,
        tmp_dir: PathBuf,
    ) -> Result<Self, Error> {
        Ok(Self {
            input: PktLineReader::new(input),
            output: PktLineWriter::new(output),
            store,
            chunker: Chunker::new(
                config.chunk_size_min,
                config.chunk_size_avg,
                config.chunk_size_max,
            )?,
            ondisk: config.ondisk,
            tmp_dir,
            stats: SessionStats::default(),
        })
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Serve the whole session: handshake, requests until the host
    /// closes its end, then the final side-branch commit.
    pub fn run(&mut self) -> Result<(), Error> {
        self.handshake().context("filter protocol handshake failed")?;
        log::debug!("handshake complete");

        while let Some(request) = self.read_request()? {
            self.stats.requests += 1;

            let mut buffer = BlobBuffer::with_mode(self.ondisk, &self.tmp_dir)?;
            self.read_payload(&mut buffer)?;
            self.stats.bytes_in += buffer.len();

            let result = match request.command.as_str() {
                "clean" => {
                    self.stats.cleans += 1;
                    self.serve_clean(&mut buffer)
                }
                "smudge" => {
                    self.stats.smudges += 1;
                    self.serve_smudge(&mut buffer)
                }
                other => Err(format_err!("unsupported filter command {other:?}")),
            };
            // buffer (and any spill file) released here, before the next request
            drop(buffer);

            if let Err(err) = result {
                log::warn!(
                    "{} failed for {:?}: {:#}",
                    request.command,
                    request.pathname,
                    err
                );
                self.reply_error()
                    .context("unable to deliver error status")?;
            }
        }

        if let Some(commit) = self
            .store
            .commit_session()
            .context("chunk branch commit failed")?
        {
            log::info!("chunk branch advanced to {commit}");
        }

        let stats = &self.stats;
        log::info!(
            "session done: {} requests ({} clean, {} smudge), {} chunks, {} bytes in, {} bytes out",
            stats.requests,
            stats.cleans,
            stats.smudges,
            stats.chunks,
            stats.bytes_in,
            stats.bytes_out,
        );
        Ok(())
    }

    /// The fixed welcome sequence of the v2 filter protocol.
    fn handshake(&mut self) -> Result<(), Error> {
        match self.read_text_packet()? {
            Some(line) if line == "git-filter-client" => (),
            Some(line) => bail!(ProtocolError::UnexpectedPacket {
                expected: "git-filter-client",
                got: line,
            }),
            None => bail!(ProtocolError::UnexpectedPacket {
                expected: "git-filter-client",
                got: "flush".to_string(),
            }),
        }

        let mut version_ok = false;
        while let Some(line) = self.read_text_packet()? {
            if line == "version=2" {
                version_ok = true;
            }
        }
        if !version_ok {
            bail!(ProtocolError::Unsupported(
                "client does not offer version 2".to_string()
            ));
        }

        self.output.write_text("git-filter-server\n")?;
        self.output.write_text("version=2\n")?;
        self.output.flush_pkt()?;

        let mut want_clean = false;
        let mut want_smudge = false;
        while let Some(line) = self.read_text_packet()? {
            match line.strip_prefix("capability=") {
                Some("clean") => want_clean = true,
                Some("smudge") => want_smudge = true,
                // "delay" in particular is never advertised back
                Some(other) => log::debug!("ignoring capability {other:?}"),
                None => log::debug!("ignoring handshake key {line:?}"),
            }
        }

        if want_clean {
            self.output.write_text("capability=clean\n")?;
        }
        if want_smudge {
            self.output.write_text("capability=smudge\n")?;
        }
        self.output.flush_pkt()?;
        Ok(())
    }

    /// Next request's key/value header, or `None` once the host closed
    /// the session.
    fn read_request(&mut self) -> Result<Option<Request>, Error> {
        let mut command = None;
        let mut pathname = None;
        let mut first = true;

        loop {
            let packet = match self.input.read_packet()? {
                Some(packet) => packet,
                None if first => return Ok(None),
                None => bail!(ProtocolError::UnexpectedEof),
            };
            first = false;

            match packet {
                Packet::Flush => break,
                Packet::Delim => bail!(ProtocolError::UnexpectedPacket {
                    expected: "request key",
                    got: "delim".to_string(),
                }),
                Packet::Data(data) => {
                    let line = text_line(&data);
                    if let Some(value) = line.strip_prefix("command=") {
                        command = Some(value.to_string());
                    } else if let Some(value) = line.strip_prefix("pathname=") {
                        pathname = Some(value.to_string());
                    } else {
                        log::debug!("ignoring request key {line:?}");
                    }
                }
            }
        }

        match command {
            Some(command) => Ok(Some(Request {
                command,
                pathname: pathname.unwrap_or_default(),
            })),
            None => bail!(ProtocolError::UnexpectedPacket {
                expected: "command key",
                got: "request without command".to_string(),
            }),
        }
    }

    fn read_payload(&mut self, buffer: &mut BlobBuffer) -> Result<(), Error> {
        loop {
            match self.input.read_packet()? {
                Some(Packet::Data(data)) => buffer.append(&data)?,
                Some(Packet::Flush) => return Ok(()),
                Some(Packet::Delim) => bail!(ProtocolError::UnexpectedPacket {
                    expected: "payload packet",
                    got: "delim".to_string(),
                }),
                None => bail!(ProtocolError::UnexpectedEof),
            }
        }
    }

    fn serve_clean(&mut self, buffer: &mut BlobBuffer) -> Result<(), Error> {
        if is_manifest(buffer)? {
            // already filtered, pass through untouched
            log::debug!("clean input is a manifest already");
            return self.reply_buffer(buffer);
        }

        let mut manifest = Manifest::new();
        for chunk in ChunkStream::new(buffer.reader()?, self.chunker.clone()) {
            let chunk = chunk?;
            let digest = self.store.insert_chunk(&chunk)?;
            self.stats.chunks += 1;
            manifest.push(digest);
        }

        self.output.write_text("status=success\n")?;
        self.output.flush_pkt()?;
        let mut writer = self.output.data_writer();
        manifest.write_to(&mut writer)?;
        writer.finish()?;
        self.stats.bytes_out += manifest.encoded_len() as u64;
        self.output.flush_pkt()?;
        // empty final list keeps the success status
        self.output.flush_pkt()?;
        Ok(())
    }

    fn serve_smudge(&mut self, buffer: &mut BlobBuffer) -> Result<(), Error> {
        let manifest = Manifest::parse_from(BufReader::new(buffer.reader()?))?;

        self.output.write_text("status=success\n")?;
        self.output.flush_pkt()?;

        for digest in manifest.digests() {
            match self.store.read_chunk(digest) {
                Ok(data) => {
                    self.output.write_data(&data)?;
                    self.stats.bytes_out += data.len() as u64;
                }
                Err(err) => {
                    // content already under way; the protocol lets the
                    // final status list revoke the success
                    log::warn!("smudge aborted at chunk {digest}: {err:#}");
                    self.output.flush_pkt()?;
                    self.output.write_text("status=error\n")?;
                    self.output.flush_pkt()?;
                    return Ok(());
                }
            }
        }

        self.output.flush_pkt()?;
        self.output.flush_pkt()?;
        Ok(())
    }

    /// Pass the buffered payload back unchanged.
    fn reply_buffer(&mut self, buffer: &mut BlobBuffer) -> Result<(), Error> {
        self.output.write_text("status=success\n")?;
        self.output.flush_pkt()?;
        let mut writer = self.output.data_writer();
        let copied = std::io::copy(&mut buffer.reader()?, &mut writer)?;
        writer.finish()?;
        self.stats.bytes_out += copied;
        self.output.flush_pkt()?;
        self.output.flush_pkt()?;
        Ok(())
    }

    fn reply_error(&mut self) -> Result<(), Error> {
        self.output.write_text("status=error\n")?;
        self.output.flush_pkt()?;
        self.output.flush_pkt()?;
        Ok(())
    }

    fn read_text_packet(&mut self) -> Result<Option<String>, Error> {
        match self.input.read_packet()? {
            Some(Packet::Data(data)) => Ok(Some(text_line(&data))),
            Some(Packet::Flush) => Ok(None),
            Some(Packet::Delim) => bail!(ProtocolError::UnexpectedPacket {
                expected: "text packet",
                got: "delim".to_string(),
            }),
            None => bail!(ProtocolError::UnexpectedEof),
        }
    }
}

// header lines are not guaranteed to be utf8 (pathnames are raw bytes)
fn text_line(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\n')
        .to_string()
}

fn is_manifest(buffer: &mut BlobBuffer) -> Result<bool, Error> {
    if buffer.len() < MANIFEST_MAGIC.len() as u64 {
        return Ok(false);
    }
    let mut head = [0u8; MANIFEST_MAGIC.len()];
    buffer.reader()?.read_exact(&mut head)?;
    if &head != MANIFEST_MAGIC {
        return Ok(false);
    }
    Ok(Manifest::parse_from(BufReader::new(buffer.reader()?)).is_ok())
}
