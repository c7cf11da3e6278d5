//! Digest computation and verification utilities.
//!
//! Digests are `algorithm ":" hex` strings; sha256 is the only algorithm
//! KitForge computes, other algorithms pass through opaquely.

use std::io::{self, Read, Write};

use kitforge_core::{KitError, Result};
use sha2::{Digest as _, Sha256};

/// The only digest algorithm KitForge produces.
pub const SHA256: &str = "sha256";

/// Compute the hex-encoded SHA256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the full `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("{}:{}", SHA256, sha256_hex(data))
}

/// Prefix a hex digest with the sha256 algorithm.
pub fn format_digest(hex: &str) -> String {
    format!("{}:{}", SHA256, hex)
}

/// Split a digest into `(algorithm, hex)` parts.
pub fn split_digest(digest: &str) -> Result<(&str, &str)> {
    match digest.split_once(':') {
        Some((alg, hex)) if !alg.is_empty() && !hex.is_empty() => Ok((alg, hex)),
        _ => Err(KitError::Integrity(format!(
            "malformed digest '{}': expected algorithm:hex",
            digest
        ))),
    }
}

/// Whether a string is a well-formed digest literal.
///
/// sha256 digests must be exactly 64 lowercase hex characters; other
/// algorithms are opaque pass-through but still require hex content.
pub fn is_valid_digest(s: &str) -> bool {
    let Some((alg, hex)) = s.split_once(':') else {
        return false;
    };
    if alg.is_empty() || hex.is_empty() {
        return false;
    }
    if !alg
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '_' | '-'))
    {
        return false;
    }
    let hex_ok = hex
        .chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if alg == SHA256 {
        hex_ok && hex.len() == 64
    } else {
        hex_ok
    }
}

/// A writer that hashes and counts everything written through it.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Finish hashing: returns the inner writer, the hex digest, and the
    /// number of bytes written.
    pub fn finalize(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A reader that verifies content against an expected digest.
///
/// The check fires when the underlying reader reaches EOF; a mismatch
/// surfaces as an `InvalidData` I/O error. `finish` drains any unread bytes
/// and reports the result as a typed error.
pub struct VerifyingReader<R: Read> {
    inner: R,
    hasher: Option<Sha256>,
    expected: String,
    failed: bool,
}

impl<R: Read> VerifyingReader<R> {
    pub fn new(inner: R, expected_digest: impl Into<String>) -> Self {
        Self {
            inner,
            hasher: Some(Sha256::new()),
            expected: expected_digest.into(),
            failed: false,
        }
    }

    fn check(&mut self) -> io::Result<()> {
        let Some(hasher) = self.hasher.take() else {
            return if self.failed {
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "digest mismatch previously detected",
                ))
            } else {
                Ok(())
            };
        };
        let actual = format_digest(&hex::encode(hasher.finalize()));
        if actual != self.expected {
            self.failed = true;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "digest mismatch: expected {}, got {}",
                    self.expected, actual
                ),
            ));
        }
        Ok(())
    }

    /// Drain the remaining bytes and verify the digest.
    pub fn finish(mut self) -> Result<()> {
        io::copy(&mut self, &mut io::sink()).map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidData {
                KitError::Integrity(e.to_string())
            } else {
                KitError::Io(e)
            }
        })?;
        Ok(())
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.check()?;
            return Ok(0);
        }
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}
