// AES-256-CBC session encryption for the transfer protocol.
//
// Filenames are encrypted one-shot with a fresh cipher context. File content
// is streamed through a single context whose chaining state carries across
// chunk boundaries, so the streamed ciphertext is byte-identical to
// encrypting the whole file at once.

use aes::cipher::block_padding::{Padding, Pkcs7};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes256, Block};
use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;
pub const BLOCK_SIZE: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Failures of the cipher itself
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key or IV length (expected {KEY_SIZE} and {IV_SIZE} bytes)")]
    InvalidLength,
    #[error("ciphertext of {0} bytes is not a whole number of blocks")]
    TruncatedCiphertext(usize),
    #[error("bad padding in final block")]
    BadPadding,
    #[error("failed to generate session keys: {0}")]
    Random(String),
}

/// Failures of a streaming encode/decode, split by which side broke
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to read stream input: {0}")]
    Source(#[source] io::Error),
    #[error("failed to write stream output: {0}")]
    Sink(#[source] io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// One-time key and IV for a single transfer
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub key: [u8; KEY_SIZE],
    pub iv: [u8; IV_SIZE],
}

impl SessionKeys {
    /// Draw a fresh key and IV from the operating system RNG
    pub fn generate() -> Result<Self, CryptoError> {
        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; IV_SIZE];

        OsRng
            .try_fill_bytes(&mut key)
            .map_err(|e| CryptoError::Random(e.to_string()))?;
        OsRng
            .try_fill_bytes(&mut iv)
            .map_err(|e| CryptoError::Random(e.to_string()))?;

        Ok(Self { key, iv })
    }

    pub fn from_parts(key: [u8; KEY_SIZE], iv: [u8; IV_SIZE]) -> Self {
        Self { key, iv }
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("key", &"<redacted>")
            .field("iv", &"<redacted>")
            .finish()
    }
}

/// Encrypt a buffer in one shot with PKCS#7 padding
pub fn encode(plaintext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidLength)?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt a buffer produced by [`encode`]
pub fn decode(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::TruncatedCiphertext(ciphertext.len()));
    }

    let cipher = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidLength)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::BadPadding)
}

/// Incremental encryptor: any number of `update` calls, then one `finalize`
pub struct StreamEncryptor {
    cipher: Aes256CbcEnc,
    pending: Vec<u8>,
}

impl StreamEncryptor {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        let cipher = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidLength)?;
        Ok(Self {
            cipher,
            pending: Vec::with_capacity(BLOCK_SIZE),
        })
    }

    /// Encrypt every complete block available so far and append it to `out`.
    /// A trailing partial block is kept for the next call.
    pub fn update(&mut self, input: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(input);
        let ready = self.pending.len() - self.pending.len() % BLOCK_SIZE;
        if ready == 0 {
            return;
        }

        let start = out.len();
        out.extend(self.pending.drain(..ready));
        for block in out[start..].chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }

    /// Pad the remaining bytes and emit the final block
    pub fn finalize(mut self, out: &mut Vec<u8>) {
        let mut block = Block::default();
        let pos = self.pending.len();
        block[..pos].copy_from_slice(&self.pending);
        Pkcs7::pad(&mut block, pos);
        self.cipher.encrypt_block_mut(&mut block);
        out.extend_from_slice(&block);
    }
}

/// Incremental decryptor. The last full block is always held back until
/// `finalize`, because only then is it known to carry the padding.
pub struct StreamDecryptor {
    cipher: Aes256CbcDec,
    pending: Vec<u8>,
}

impl StreamDecryptor {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        let cipher = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidLength)?;
        Ok(Self {
            cipher,
            pending: Vec::with_capacity(2 * BLOCK_SIZE),
        })
    }

    pub fn update(&mut self, input: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(input);
        let len = self.pending.len();
        if len <= BLOCK_SIZE {
            return;
        }

        let mut ready = len - len % BLOCK_SIZE;
        if ready == len {
            ready -= BLOCK_SIZE;
        }

        let start = out.len();
        out.extend(self.pending.drain(..ready));
        for block in out[start..].chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }

    /// Decrypt the held-back block and strip its padding
    pub fn finalize(mut self, out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if self.pending.len() != BLOCK_SIZE {
            return Err(CryptoError::TruncatedCiphertext(self.pending.len()));
        }

        let mut block = Block::clone_from_slice(&self.pending);
        self.cipher.decrypt_block_mut(&mut block);
        let plain = Pkcs7::unpad(&block).map_err(|_| CryptoError::BadPadding)?;
        out.extend_from_slice(plain);
        Ok(())
    }
}

/// Read `source` in chunks of up to `chunk_size` bytes, encrypt them with one
/// continuing cipher context and write each encrypted piece to `sink` as soon
/// as it is produced. Returns the number of plaintext bytes consumed.
pub fn encode_stream<R: Read, W: Write>(
    source: &mut R,
    chunk_size: usize,
    key: &[u8],
    iv: &[u8],
    sink: &mut W,
) -> Result<u64, StreamError> {
    let mut encryptor = StreamEncryptor::new(key, iv)?;
    let mut in_buf = vec![0u8; chunk_size.max(1)];
    let mut out_buf = Vec::with_capacity(in_buf.len() + BLOCK_SIZE);
    let mut total = 0u64;
    let mut chunks = 0u64;

    loop {
        let n = match source.read(&mut in_buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StreamError::Source(e)),
        };

        out_buf.clear();
        encryptor.update(&in_buf[..n], &mut out_buf);
        if !out_buf.is_empty() {
            sink.write_all(&out_buf).map_err(StreamError::Sink)?;
        }

        total += n as u64;
        chunks += 1;
    }

    out_buf.clear();
    encryptor.finalize(&mut out_buf);
    sink.write_all(&out_buf).map_err(StreamError::Sink)?;
    sink.flush().map_err(StreamError::Sink)?;

    debug!("Encoded {} bytes in {} chunks", total, chunks);
    Ok(total)
}

/// Mirror of [`encode_stream`]: read ciphertext in pieces of up to
/// `chunk_size` plus one block, decrypt with one continuing context and append
/// the plaintext to `sink`. Returns the number of plaintext bytes written.
pub fn decode_stream<R: Read, W: Write>(
    source: &mut R,
    chunk_size: usize,
    key: &[u8],
    iv: &[u8],
    sink: &mut W,
) -> Result<u64, StreamError> {
    let mut decryptor = StreamDecryptor::new(key, iv)?;
    let mut in_buf = vec![0u8; chunk_size.max(1) + BLOCK_SIZE];
    let mut out_buf = Vec::with_capacity(in_buf.len());
    let mut total = 0u64;

    loop {
        let n = match source.read(&mut in_buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StreamError::Source(e)),
        };

        out_buf.clear();
        decryptor.update(&in_buf[..n], &mut out_buf);
        if !out_buf.is_empty() {
            sink.write_all(&out_buf).map_err(StreamError::Sink)?;
            total += out_buf.len() as u64;
        }
    }

    out_buf.clear();
    decryptor.finalize(&mut out_buf)?;
    sink.write_all(&out_buf).map_err(StreamError::Sink)?;
    sink.flush().map_err(StreamError::Sink)?;
    total += out_buf.len() as u64;

    debug!("Decoded {} bytes", total);
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const CHUNK: usize = 1024;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 + 7) as u8).collect()
    }

    fn keys() -> SessionKeys {
        SessionKeys::from_parts([0x42; KEY_SIZE], [0x24; IV_SIZE])
    }

    /// Reader that hands out data in a repeating pattern of uneven reads
    struct SplitReader {
        data: Vec<u8>,
        pos: usize,
        splits: Vec<usize>,
        turn: usize,
    }

    impl SplitReader {
        fn new(data: Vec<u8>, splits: &[usize]) -> Self {
            Self {
                data,
                pos: 0,
                splits: splits.to_vec(),
                turn: 0,
            }
        }
    }

    impl Read for SplitReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let want = self.splits[self.turn % self.splits.len()];
            self.turn += 1;
            let n = want.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let k = keys();
        for len in [0, 1, 15, 16, 17, 255, 1000] {
            let plain = sample(len);
            let cipher = encode(&plain, &k.key, &k.iv).unwrap();
            assert_eq!(cipher.len(), (len / BLOCK_SIZE + 1) * BLOCK_SIZE);
            assert_eq!(decode(&cipher, &k.key, &k.iv).unwrap(), plain);
        }
    }

    #[test]
    fn test_invalid_key_length_is_rejected() {
        let result = encode(b"data", &[0u8; 16], &[0u8; IV_SIZE]);
        assert!(matches!(result, Err(CryptoError::InvalidLength)));
    }

    #[test]
    fn test_decode_rejects_partial_block() {
        let k = keys();
        let result = decode(&[0u8; 20], &k.key, &k.iv);
        assert!(matches!(result, Err(CryptoError::TruncatedCiphertext(20))));
    }

    #[test]
    fn test_stream_matches_single_shot() {
        let k = keys();
        for len in [0, 1, CHUNK - 1, CHUNK, CHUNK + 1, 5 * CHUNK + 123] {
            let plain = sample(len);
            let expected = encode(&plain, &k.key, &k.iv).unwrap();

            let mut encoded = Vec::new();
            let consumed =
                encode_stream(&mut Cursor::new(plain.clone()), CHUNK, &k.key, &k.iv, &mut encoded)
                    .unwrap();
            assert_eq!(consumed, len as u64);
            assert_eq!(encoded, expected, "stream ciphertext differs for len {}", len);

            let mut decoded = Vec::new();
            let written =
                decode_stream(&mut Cursor::new(encoded), CHUNK, &k.key, &k.iv, &mut decoded)
                    .unwrap();
            assert_eq!(written, len as u64);
            assert_eq!(decoded, plain, "stream plaintext differs for len {}", len);
        }
    }

    #[test]
    fn test_stream_survives_arbitrary_read_splits() {
        let k = keys();
        let plain = sample(3 * CHUNK + 77);
        let expected = encode(&plain, &k.key, &k.iv).unwrap();

        for splits in [&[1usize][..], &[7, 16, 3], &[1040, 5], &[33, 1, 2048]] {
            let mut encoded = Vec::new();
            let mut reader = SplitReader::new(plain.clone(), splits);
            encode_stream(&mut reader, CHUNK, &k.key, &k.iv, &mut encoded).unwrap();
            assert_eq!(encoded, expected);

            let mut decoded = Vec::new();
            let mut reader = SplitReader::new(encoded, splits);
            decode_stream(&mut reader, CHUNK, &k.key, &k.iv, &mut decoded).unwrap();
            assert_eq!(decoded, plain);
        }
    }

    #[test]
    fn test_decode_stream_rejects_empty_input() {
        let k = keys();
        let mut decoded = Vec::new();
        let result = decode_stream(&mut Cursor::new(Vec::new()), CHUNK, &k.key, &k.iv, &mut decoded);
        assert!(matches!(
            result,
            Err(StreamError::Crypto(CryptoError::TruncatedCiphertext(0)))
        ));
    }

    #[test]
    fn test_tampered_key_or_iv_never_reproduces_plaintext() {
        let k = keys();
        let plain = sample(4 * BLOCK_SIZE + 5);
        let cipher = encode(&plain, &k.key, &k.iv).unwrap();

        for i in [0, 13, KEY_SIZE - 1] {
            let mut key = k.key;
            key[i] ^= 0x01;
            match decode(&cipher, &key, &k.iv) {
                Ok(out) => assert_ne!(out, plain),
                Err(e) => assert!(matches!(e, CryptoError::BadPadding)),
            }
        }

        for i in [0, IV_SIZE - 1] {
            let mut iv = k.iv;
            iv[i] ^= 0x80;
            match decode(&cipher, &k.key, &iv) {
                Ok(out) => assert_ne!(out, plain),
                Err(e) => assert!(matches!(e, CryptoError::BadPadding)),
            }
        }
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = SessionKeys::generate().unwrap();
        let b = SessionKeys::generate().unwrap();
        assert_ne!(a, b);
        assert!(format!("{:?}", a).contains("redacted"));
    }
}
