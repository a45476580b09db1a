use std::io::{BufRead, Read, Write};

use anyhow::Error;

/// First line of every manifest blob.
pub const MANIFEST_MAGIC: &[u8; 8] = b"fastcdc\n";

// longest supported digest (SHA-256 object format)
const MAX_DIGEST_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum InvalidManifest {
    #[error("missing fastcdc magic line")]
    BadMagic,
    #[error("malformed digest line {0:?}")]
    BadDigest(String),
}

/// `true` for a full lowercase hex object id (SHA-1 or SHA-256 length).
pub fn is_valid_digest(digest: &str) -> bool {
    (digest.len() == 40 || digest.len() == MAX_DIGEST_LEN)
        && digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Ordered chunk digest list reconstructing one filtered file.
///
/// Wire form is line oriented text: the magic line, then one digest per
/// line. An empty file's manifest is just the magic line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    digests: Vec<String>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, digest: String) {
        self.digests.push(digest);
    }

    pub fn digests(&self) -> &[String] {
        &self.digests
    }

    pub fn chunk_count(&self) -> usize {
        self.digests.len()
    }

    /// Parse a manifest, streaming. Violations of the format surface as
    /// [InvalidManifest] so callers can answer them per-request.
    pub fn parse_from<R: BufRead>(mut reader: R) -> Result<Self, Error> {
        let mut magic = [0u8; MANIFEST_MAGIC.len()];
        match reader.read_exact(&mut magic) {
            Ok(()) => (),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(InvalidManifest::BadMagic.into());
            }
            Err(err) => return Err(err.into()),
        }
        if &magic != MANIFEST_MAGIC {
            return Err(InvalidManifest::BadMagic.into());
        }

        let mut digests = Vec::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            // a valid line is at most digest + newline; longer means garbage
            let limit = (MAX_DIGEST_LEN + 1) as u64;
            let n = (&mut reader).take(limit).read_until(b'\n', &mut line)?;
            if n == 0 {
                break;
            }
            if line.last() != Some(&b'\n') {
                return Err(bad_digest(&line).into());
            }
            line.pop();
            match std::str::from_utf8(&line) {
                Ok(digest) if is_valid_digest(digest) => digests.push(digest.to_string()),
                _ => return Err(bad_digest(&line).into()),
            }
        }

        Ok(Self { digests })
    }

    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        Self::parse_from(data)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(MANIFEST_MAGIC)?;
        for digest in &self.digests {
            writer.write_all(digest.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.encoded_len());
        data.extend_from_slice(MANIFEST_MAGIC);
        for digest in &self.digests {
            data.extend_from_slice(digest.as_bytes());
            data.push(b'\n');
        }
        data
    }

    pub fn encoded_len(&self) -> usize {
        MANIFEST_MAGIC.len()
            + self
                .digests
                .iter()
                .map(|digest| digest.len() + 1)
                .sum::<usize>()
    }
}

fn bad_digest(line: &[u8]) -> InvalidManifest {
    InvalidManifest::BadDigest(String::from_utf8_lossy(line).into_owned())
}

#[cfg(test)]
mod test {
    use super::*;

    const DIGEST_A: &str = "aa6532f55b55013bab4f5a20f1d2d4a502cba186";
    const DIGEST_B: &str = "bbd9dbf9644793b4ff4ff4c104b36e04987dbb67";

    #[test]
    fn test_roundtrip() {
        let mut manifest = Manifest::new();
        manifest.push(DIGEST_A.to_string());
        manifest.push(DIGEST_B.to_string());

        let data = manifest.to_bytes();
        assert_eq!(
            data,
            format!("fastcdc\n{DIGEST_A}\n{DIGEST_B}\n").into_bytes()
        );
        assert_eq!(Manifest::parse(&data).unwrap(), manifest);
    }

    #[test]
    fn test_empty_file_manifest() {
        let manifest = Manifest::new();
        assert_eq!(manifest.to_bytes(), b"fastcdc\n");

        let parsed = Manifest::parse(b"fastcdc\n").unwrap();
        assert_eq!(parsed.chunk_count(), 0);
    }

    #[test]
    fn test_rejects_missing_magic() {
        for input in [&b"hello\n"[..], &b""[..], &b"fastcd"[..], &b"FASTCDC\n"[..]] {
            let err = Manifest::parse(input).unwrap_err();
            assert!(err.downcast_ref::<InvalidManifest>().is_some(), "{input:?}");
        }
    }

    #[test]
    fn test_rejects_bad_digest_lines() {
        let bad = [
            "fastcdc\nshort\n".to_string(),
            "fastcdc\nAA6532F55B55013BAB4F5A20F1D2D4A502CBA186\n".to_string(),
            format!("fastcdc\n{DIGEST_A}"),    // unterminated
            format!("fastcdc\n{DIGEST_A}x\n"), // wrong length
            format!("fastcdc\n{DIGEST_A}\n\n"), // empty line
        ];
        for input in &bad {
            let err = Manifest::parse(input.as_bytes()).unwrap_err();
            assert!(err.downcast_ref::<InvalidManifest>().is_some(), "{input:?}");
        }
    }

    #[test]
    fn test_sha256_digest_accepted() {
        let digest = "c6a4f77d9a5b0cb5c5b0bb4e4575cac1c5462bd77b55ea9bcbc38f7b6f2f9f1a";
        let manifest = Manifest::parse(format!("fastcdc\n{digest}\n").as_bytes()).unwrap();
        assert_eq!(manifest.digests(), [digest.to_string()]);
    }
}
