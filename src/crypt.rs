//! AES-128-CBC segment encryption write-through.
//!
//! Sits between the write-buffer queue and the host callback. Plaintext is
//! encrypted in 16-byte blocks as it streams through; at most one partial
//! block is held back between writes. The final partial block is padded
//! PKCS#7-style on the closing flush; block-aligned plaintext is emitted
//! without an extra padding block, so the ciphertext length is always the
//! plaintext length rounded up to the next block.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncryptMut, KeyIvInit};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::queue::{WriteCallback, WriteStatus};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

pub const AES_BLOCK_SIZE: usize = 16;

/// Round a plaintext length up to the ciphertext length it produces.
pub fn aes_round_up_to_block(size: u64) -> u64 {
    (size + AES_BLOCK_SIZE as u64 - 1) / AES_BLOCK_SIZE as u64 * AES_BLOCK_SIZE as u64
}

/// Streaming AES-128-CBC encryptor wrapping the host write callback.
pub struct AesCbcWriter {
    cipher: Aes128CbcEnc,
    partial: [u8; AES_BLOCK_SIZE],
    partial_len: usize,
    /// Ciphertext the callback has not accepted yet (backpressure).
    pending: BytesMut,
    callback: WriteCallback,
    finished: bool,
}

impl AesCbcWriter {
    pub fn new(key: &[u8; 16], iv: &[u8; 16], callback: WriteCallback) -> Self {
        Self {
            cipher: Aes128CbcEnc::new(key.into(), iv.into()),
            partial: [0u8; AES_BLOCK_SIZE],
            partial_len: 0,
            pending: BytesMut::new(),
            callback,
            finished: false,
        }
    }

    /// Encrypt and forward. The plaintext is always consumed; on `Again` the
    /// ciphertext is retained and retried by [`drain`](Self::drain).
    pub fn write(&mut self, data: &[u8]) -> Result<WriteStatus> {
        let mut input = data;

        // complete a held-back partial block first
        if self.partial_len > 0 {
            let take = (AES_BLOCK_SIZE - self.partial_len).min(input.len());
            self.partial[self.partial_len..self.partial_len + take]
                .copy_from_slice(&input[..take]);
            self.partial_len += take;
            input = &input[take..];

            if self.partial_len == AES_BLOCK_SIZE {
                let mut block = self.partial;
                self.cipher
                    .encrypt_block_mut(GenericArray::from_mut_slice(&mut block));
                self.pending.put_slice(&block);
                self.partial_len = 0;
            }
        }

        let whole = input.len() / AES_BLOCK_SIZE * AES_BLOCK_SIZE;
        if whole > 0 {
            let start = self.pending.len();
            self.pending.put_slice(&input[..whole]);
            for chunk in self.pending[start..].chunks_exact_mut(AES_BLOCK_SIZE) {
                self.cipher
                    .encrypt_block_mut(GenericArray::from_mut_slice(chunk));
            }
        }

        let rest = &input[whole..];
        self.partial[..rest.len()].copy_from_slice(rest);
        self.partial_len = rest.len();

        self.try_send()
    }

    /// Retry delivering retained ciphertext.
    pub fn drain(&mut self) -> Result<WriteStatus> {
        self.try_send()
    }

    /// Pad and emit the trailing block, then deliver everything retained.
    pub fn finish(&mut self) -> Result<WriteStatus> {
        if !self.finished {
            self.finished = true;
            if self.partial_len > 0 {
                let pad = (AES_BLOCK_SIZE - self.partial_len) as u8;
                for byte in self.partial[self.partial_len..].iter_mut() {
                    *byte = pad;
                }
                let mut block = self.partial;
                self.cipher
                    .encrypt_block_mut(GenericArray::from_mut_slice(&mut block));
                self.pending.put_slice(&block);
                self.partial_len = 0;
            }
        }
        self.try_send()
    }

    fn try_send(&mut self) -> Result<WriteStatus> {
        if self.pending.is_empty() {
            return Ok(WriteStatus::Done);
        }
        let buf: Bytes = self.pending.split().freeze();
        match (self.callback)(buf.clone())? {
            WriteStatus::Done => Ok(WriteStatus::Done),
            WriteStatus::Again => {
                self.pending = BytesMut::from(&buf[..]);
                Ok(WriteStatus::Again)
            }
        }
    }
}
