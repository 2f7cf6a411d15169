//! DARE-style authenticated stream encryption.
//!
//! Plaintext is cut into packages of at most 64 KiB. Each package is
//!
//! ```text
//! header (16 bytes) || ciphertext || tag (16 bytes)
//!
//! header[0]      version (0x20)
//! header[1]      cipher suite
//! header[2..4]   payload length - 1, little endian
//! header[4..16]  package nonce; bit 7 of header[4] marks the final package
//! ```
//!
//! The package nonce is the stream nonce with the package sequence number
//! XOR-ed into its last four bytes, so reordered, dropped or replayed
//! packages fail authentication. `header[0..4]` is authenticated as
//! associated data. A stream whose last package is not flagged final is
//! rejected as truncated. An empty plaintext encrypts to an empty stream.

use std::io::{self, Read, Write};

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;

use crate::error::{Error, Result};

pub const VERSION: u8 = 0x20;
pub const HEADER_SIZE: usize = 16;
pub const TAG_SIZE: usize = 16;
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;
pub const KEY_SIZE: usize = 32;

const NONCE_SIZE: usize = 12;
const FINAL_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    Aes256Gcm = 0,
    ChaCha20Poly1305 = 1,
}

impl CipherSuite {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(CipherSuite::Aes256Gcm),
            1 => Some(CipherSuite::ChaCha20Poly1305),
            _ => None,
        }
    }
}

/// Process-wide data key.
#[derive(Clone)]
pub struct DareKey([u8; KEY_SIZE]);

impl DareKey {
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Decode a 64-character hex key.
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| Error::fatal(format!("encrypt key is not hex: {}", e)))?;
        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::fatal(format!("encrypt key must be {} bytes", KEY_SIZE)))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for DareKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DareKey(..)")
    }
}

enum Sealer {
    Aes(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

impl Sealer {
    fn new(suite: CipherSuite, key: &DareKey) -> Self {
        match suite {
            CipherSuite::Aes256Gcm => Sealer::Aes(Box::new(Aes256Gcm::new((&key.0).into()))),
            CipherSuite::ChaCha20Poly1305 => {
                Sealer::ChaCha(Box::new(ChaCha20Poly1305::new((&key.0).into())))
            }
        }
    }

    fn seal(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        let sealed = match self {
            Sealer::Aes(c) => c.encrypt(nonce.into(), payload),
            Sealer::ChaCha(c) => c.encrypt(nonce.into(), payload),
        };
        sealed.map_err(|_| Error::fatal("aead seal failed"))
    }

    fn open(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        let opened = match self {
            Sealer::Aes(c) => c.decrypt(nonce.into(), payload),
            Sealer::ChaCha(c) => c.decrypt(nonce.into(), payload),
        };
        opened.map_err(|_| Error::Corrupt)
    }
}

/// Size of the ciphertext produced for `plaintext_len` bytes.
pub fn encrypted_size(plaintext_len: u64) -> u64 {
    let max = MAX_PAYLOAD_SIZE as u64;
    let packages = plaintext_len.div_ceil(max);
    plaintext_len + packages * (HEADER_SIZE + TAG_SIZE) as u64
}

fn package_nonce(stream_nonce: &[u8; NONCE_SIZE], seq: u32, last: bool) -> [u8; NONCE_SIZE] {
    let mut nonce = *stream_nonce;
    for (b, s) in nonce[8..].iter_mut().zip(seq.to_le_bytes()) {
        *b ^= s;
    }
    if last {
        nonce[0] |= FINAL_FLAG;
    }
    nonce
}

/// Fill `buf` from `reader` until full or EOF. Returns the bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn io_err(e: io::Error) -> Error {
    Error::transient(format!("dare io: {}", e))
}

/// Encrypt everything `reader` yields into `writer`. Returns ciphertext bytes written.
///
/// Holds at most two plaintext packages in memory regardless of stream length.
pub fn encrypt_stream<R: Read, W: Write>(
    key: &DareKey,
    suite: CipherSuite,
    mut reader: R,
    mut writer: W,
) -> Result<u64> {
    let sealer = Sealer::new(suite, key);

    let mut stream_nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut stream_nonce);
    stream_nonce[0] &= !FINAL_FLAG;

    let mut current = vec![0u8; MAX_PAYLOAD_SIZE];
    let mut next = vec![0u8; MAX_PAYLOAD_SIZE];
    let mut current_len = read_full(&mut reader, &mut current).map_err(io_err)?;
    let mut seq: u32 = 0;
    let mut written: u64 = 0;

    while current_len > 0 {
        let next_len = if current_len == MAX_PAYLOAD_SIZE {
            read_full(&mut reader, &mut next).map_err(io_err)?
        } else {
            0
        };
        let last = next_len == 0;

        let nonce = package_nonce(&stream_nonce, seq, last);
        let mut header = [0u8; HEADER_SIZE];
        header[0] = VERSION;
        header[1] = suite as u8;
        header[2..4].copy_from_slice(&((current_len - 1) as u16).to_le_bytes());
        header[4..].copy_from_slice(&nonce);

        let sealed = sealer.seal(&nonce, &header[..4], &current[..current_len])?;
        writer.write_all(&header).map_err(io_err)?;
        writer.write_all(&sealed).map_err(io_err)?;
        written += (HEADER_SIZE + sealed.len()) as u64;

        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
        seq = seq
            .checked_add(1)
            .ok_or_else(|| Error::invalid("stream exceeds package sequence space"))?;
    }

    writer.flush().map_err(io_err)?;
    Ok(written)
}

/// Decrypt a stream produced by [`encrypt_stream`]. Returns plaintext bytes written.
///
/// Any tampered, reordered or truncated package yields [`Error::Corrupt`].
pub fn decrypt_stream<R: Read, W: Write>(key: &DareKey, mut reader: R, mut writer: W) -> Result<u64> {
    let mut header = [0u8; HEADER_SIZE];
    let mut package = vec![0u8; MAX_PAYLOAD_SIZE + TAG_SIZE];
    let mut sealer: Option<(CipherSuite, Sealer)> = None;
    let mut stream_nonce = [0u8; NONCE_SIZE];
    let mut seq: u32 = 0;
    let mut finished = false;
    let mut written: u64 = 0;

    loop {
        let n = read_full(&mut reader, &mut header).map_err(io_err)?;
        if n == 0 {
            break;
        }
        if finished || n < HEADER_SIZE || header[0] != VERSION {
            return Err(Error::Corrupt);
        }

        let suite = CipherSuite::from_byte(header[1]).ok_or(Error::Corrupt)?;
        let (active_suite, active) =
            sealer.get_or_insert_with(|| (suite, Sealer::new(suite, key)));
        if *active_suite != suite {
            return Err(Error::Corrupt);
        }

        let payload_len = u16::from_le_bytes([header[2], header[3]]) as usize + 1;
        let sealed_len = payload_len + TAG_SIZE;
        if read_full(&mut reader, &mut package[..sealed_len]).map_err(io_err)? != sealed_len {
            return Err(Error::Corrupt);
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&header[4..]);
        let last = nonce[0] & FINAL_FLAG != 0;
        if seq == 0 {
            stream_nonce = nonce;
            stream_nonce[0] &= !FINAL_FLAG;
        } else if package_nonce(&stream_nonce, seq, last) != nonce {
            return Err(Error::Corrupt);
        }
        if !last && payload_len != MAX_PAYLOAD_SIZE {
            return Err(Error::Corrupt);
        }

        let plaintext = active.open(&nonce, &header[..4], &package[..sealed_len])?;
        writer.write_all(&plaintext).map_err(io_err)?;
        written += plaintext.len() as u64;

        finished = last;
        seq = seq.checked_add(1).ok_or(Error::Corrupt)?;
    }

    if seq > 0 && !finished {
        return Err(Error::Corrupt);
    }
    writer.flush().map_err(io_err)?;
    Ok(written)
}
