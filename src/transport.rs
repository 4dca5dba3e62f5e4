// src/transport.rs - Authenticated-encrypted framing of the slave<->master link
//
// Every message crosses the wire as two AEAD frames: a 2-byte little-endian
// payload length, then the payload itself. Each frame is
// XChaCha20-Poly1305 sealed with a fresh random 24-byte nonce prefixed and
// the 16-byte tag appended, so the per-frame overhead is 40 bytes.
use crate::error::{PoolError, Result};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Nonce (24) + Poly1305 tag (16)
pub const FRAME_OVERHEAD: usize = 40;

const NONCE_LEN: usize = 24;

/// Frame cipher shared by both ends; key = SHA-256(master password)
#[derive(Clone)]
pub struct LinkCipher {
    aead: XChaCha20Poly1305,
}

impl LinkCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        LinkCipher {
            aead: XChaCha20Poly1305::new(key.into()),
        }
    }

    /// Seal a plaintext into `nonce || ciphertext || tag`
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let mut out = Vec::with_capacity(plaintext.len() + FRAME_OVERHEAD);
        out.extend_from_slice(&nonce);
        // encryption with a fresh random nonce cannot fail
        let ciphertext = self
            .aead
            .encrypt(&nonce, plaintext)
            .expect("XChaCha20-Poly1305 encryption");
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Open a sealed frame. Any tampering or truncation is an error; the
    /// caller must close the connection.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(PoolError::framing("ciphertext shorter than nonce"));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.aead
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| PoolError::framing("frame decryption failed"))
    }
}

/// Reading half of an encrypted link
pub struct FrameReader<R> {
    inner: R,
    cipher: LinkCipher,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, cipher: LinkCipher) -> Self {
        FrameReader { inner, cipher }
    }

    /// Receive one message: read and open the length frame, then exactly
    /// the announced payload frame.
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        let mut len_frame = [0u8; 2 + FRAME_OVERHEAD];
        self.inner.read_exact(&mut len_frame).await?;
        let len_plain = self.cipher.open(&len_frame)?;
        if len_plain.len() != 2 {
            return Err(PoolError::framing("length frame has wrong size"));
        }
        let len = u16::from_le_bytes([len_plain[0], len_plain[1]]) as usize;

        let mut payload_frame = vec![0u8; len + FRAME_OVERHEAD];
        self.inner.read_exact(&mut payload_frame).await?;
        self.cipher.open(&payload_frame)
    }
}

/// Writing half of an encrypted link
pub struct FrameWriter<W> {
    inner: W,
    cipher: LinkCipher,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, cipher: LinkCipher) -> Self {
        FrameWriter { inner, cipher }
    }

    /// Send one message as its two sealed frames
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > u16::MAX as usize {
            return Err(PoolError::framing("message exceeds the 64 KiB frame limit"));
        }
        let len_bytes = (payload.len() as u16).to_le_bytes();
        self.inner.write_all(&self.cipher.seal(&len_bytes)).await?;
        self.inner.write_all(&self.cipher.seal(payload)).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Split a stream into the two framed halves sharing one cipher
pub fn framed_pair<S>(stream: S, key: &[u8; 32]) -> (FrameReader<tokio::io::ReadHalf<S>>, FrameWriter<tokio::io::WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let cipher = LinkCipher::new(key);
    let (read_half, write_half) = tokio::io::split(stream);
    (
        FrameReader::new(read_half, cipher.clone()),
        FrameWriter::new(write_half, cipher),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = LinkCipher::new(&KEY);
        let sealed = cipher.seal(b"aggregated shares");
        assert_eq!(sealed.len(), b"aggregated shares".len() + FRAME_OVERHEAD);
        assert_eq!(cipher.open(&sealed).unwrap(), b"aggregated shares");
    }

    #[test]
    fn test_any_bit_flip_fails_decryption() {
        let cipher = LinkCipher::new(&KEY);
        let sealed = cipher.seal(b"payload");

        for byte in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[byte] ^= 0x01;
            assert!(
                cipher.open(&tampered).is_err(),
                "flip at byte {} must fail",
                byte
            );
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = LinkCipher::new(&KEY).seal(b"payload");
        let other = LinkCipher::new(&[8u8; 32]);
        assert!(other.open(&sealed).is_err());
    }

    #[tokio::test]
    async fn test_framed_link_roundtrip() {
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut writer) = framed_pair(client, &KEY);
        let (mut reader, _) = framed_pair(server, &KEY);

        writer.send(b"first").await.unwrap();
        writer.send(&[0u8; 0]).await.unwrap();
        writer.send(&vec![0x5a; 1000]).await.unwrap();

        assert_eq!(reader.recv().await.unwrap(), b"first");
        assert_eq!(reader.recv().await.unwrap(), Vec::<u8>::new());
        assert_eq!(reader.recv().await.unwrap(), vec![0x5a; 1000]);
    }

    #[tokio::test]
    async fn test_mismatched_keys_close_the_link() {
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut writer) = framed_pair(client, &KEY);
        let (mut reader, _) = framed_pair(server, &[9u8; 32]);

        writer.send(b"hello").await.unwrap();
        assert!(reader.recv().await.is_err());
    }
}
