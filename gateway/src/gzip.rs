//! Gzip request bodies
//!
//! [`GzipHashReader`] inflates a gzip body in front of a
//! [`Decoder`](crate::decode::Decoder). On the way it counts the compressed
//! bytes consumed and feeds them to an MD5 hasher. Both live in a
//! [`BodyDigest`] handle, which stays readable after the reader has moved
//! into the decoder.
//!
//! The checksum covers the body as received, not the inflated records.

use flate2::read::GzDecoder;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use std::io::{self, Read};
use std::sync::Arc;

/// Length of an MD5 sum
pub const MD5_LEN: usize = 16;

#[derive(Default)]
struct DigestState {
    bytes_read: u64,
    hasher: Md5,
}

/// Compressed byte count and checksum of one body
#[derive(Clone, Default)]
pub struct BodyDigest {
    state: Arc<Mutex<DigestState>>,
}

impl BodyDigest {
    /// Compressed bytes consumed so far
    pub fn bytes_read(&self) -> u64 {
        self.state.lock().bytes_read
    }

    /// MD5 of the compressed bytes consumed so far
    pub fn sum(&self) -> [u8; MD5_LEN] {
        let digest = self.state.lock().hasher.clone().finalize();
        let mut out = [0u8; MD5_LEN];
        out.copy_from_slice(&digest);
        out
    }

    /// [`BodyDigest::sum`] as lowercase hex
    pub fn hex(&self) -> String {
        hex::encode(self.sum())
    }

    fn record(&self, chunk: &[u8]) {
        let mut state = self.state.lock();
        state.bytes_read += chunk.len() as u64;
        state.hasher.update(chunk);
    }
}

/// Passes reads through, recording every chunk
struct Tee<R> {
    inner: R,
    digest: BodyDigest,
}

impl<R: Read> Read for Tee<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.record(&buf[..n]);
        Ok(n)
    }
}

/// Inflating reader that also hashes what it consumes
///
/// Header and stream errors surface from `read` as `io::Error`, so a
/// decoder reports them as a read error at the inflated offset.
pub struct GzipHashReader<R> {
    inner: GzDecoder<Tee<R>>,
    digest: BodyDigest,
}

impl<R: Read> GzipHashReader<R> {
    /// Wrap a gzip-compressed source
    pub fn new(source: R) -> Self {
        let digest = BodyDigest::default();
        let tee = Tee {
            inner: source,
            digest: digest.clone(),
        };
        Self {
            inner: GzDecoder::new(tee),
            digest,
        }
    }

    /// Handle to the byte count and checksum
    pub fn digest(&self) -> BodyDigest {
        self.digest.clone()
    }

    /// Compressed bytes consumed so far
    pub fn bytes_read(&self) -> u64 {
        self.digest.bytes_read()
    }

    /// MD5 of the compressed bytes consumed so far
    pub fn sum(&self) -> [u8; MD5_LEN] {
        self.digest.sum()
    }
}

impl<R: Read> Read for GzipHashReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).inspect_err(|e| {
            tracing::debug!(
                error = %e,
                bytes_read = self.digest.bytes_read(),
                "gzip body read failed"
            );
        })
    }
}
