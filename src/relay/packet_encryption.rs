/// AEAD parameters the relay protocol reserves space for: a 12-byte nonce and a
///  16-byte authentication tag per packet.
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Per-packet payload protection inside the relay envelope.
///
/// `decrypt(encrypt(p)) == p` must hold for all payloads. [`overhead`](Self::overhead)
///  is charged against the tunnel MTU up front, so switching implementations never
///  changes the payload budget the layers above see.
pub trait RelayEncryption {
    /// number of bytes `encrypt` may add on top of the plaintext length
    fn overhead(&self) -> usize;

    /// writes the protected payload into `out`, returning the number of bytes written
    fn encrypt(&self, plaintext: &[u8], out: &mut [u8]) -> usize;

    /// writes the recovered payload into `out`, returning the number of bytes written
    fn decrypt(&self, ciphertext: &[u8], out: &mut [u8]) -> usize;
}

/// Identity transform. The AES-GCM implementation is not wired up yet, but the
///  nonce and tag budget is already reserved so enabling it stays wire-compatible.
pub struct PassthroughEncryption {
    _key: Vec<u8>,
}

impl PassthroughEncryption {
    pub fn new(room_secret: &[u8]) -> PassthroughEncryption {
        PassthroughEncryption {
            _key: room_secret.to_vec(),
        }
    }
}

impl RelayEncryption for PassthroughEncryption {
    fn overhead(&self) -> usize {
        NONCE_SIZE + TAG_SIZE
    }

    fn encrypt(&self, plaintext: &[u8], out: &mut [u8]) -> usize {
        out[..plaintext.len()].copy_from_slice(plaintext);
        plaintext.len()
    }

    fn decrypt(&self, ciphertext: &[u8], out: &mut [u8]) -> usize {
        out[..ciphertext.len()].copy_from_slice(ciphertext);
        ciphertext.len()
    }
}
