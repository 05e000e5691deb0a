use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xsalsa20poly1305::{
    KeyInit, NONCE_SIZE, Nonce, TAG_SIZE, Tag, XSalsa20Poly1305, aead::AeadInPlace,
};

use crate::gateway::constants::RTP_HEADER_LEN;

/// Length of the voice secret key.
pub const KEY_SIZE: usize = 32;

/// Length of the clear-text nonce appended in lite mode.
const LITE_NONCE_LEN: usize = 4;

/// Negotiable voice encryption modes.
///
/// All three use XSalsa20-Poly1305 and differ only in where the nonce comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherMode {
    /// The RTP header, zero padded, is the nonce.
    #[serde(rename = "xsalsa20_poly1305")]
    Normal,
    /// A random 24-byte nonce is appended to the packet.
    #[serde(rename = "xsalsa20_poly1305_suffix")]
    Suffix,
    /// A 32-bit counter is appended to the packet and zero padded into the nonce.
    #[serde(rename = "xsalsa20_poly1305_lite")]
    Lite,
}

impl CipherMode {
    pub const ALL: [CipherMode; 3] = [Self::Lite, Self::Suffix, Self::Normal];

    pub fn name(self) -> &'static str {
        match self {
            Self::Normal => "xsalsa20_poly1305",
            Self::Suffix => "xsalsa20_poly1305_suffix",
            Self::Lite => "xsalsa20_poly1305_lite",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    /// Bytes appended after the ciphertext.
    pub fn suffix_len(self) -> usize {
        match self {
            Self::Normal => 0,
            Self::Suffix => NONCE_SIZE,
            Self::Lite => LITE_NONCE_LEN,
        }
    }

    /// Picks the first mode of `preferred` that the server offers.
    pub fn negotiate<S: AsRef<str>>(preferred: &[CipherMode], offered: &[S]) -> Option<Self> {
        preferred
            .iter()
            .copied()
            .find(|mode| offered.iter().any(|o| o.as_ref() == mode.name()))
    }
}

impl std::fmt::Display for CipherMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("secret key must be {KEY_SIZE} bytes, got {0}")]
    KeyLength(usize),
    #[error("packet of {0} bytes is too short for the negotiated mode")]
    PacketTooShort(usize),
    #[error("packet failed authentication")]
    Authentication,
}

/// Authenticated encryption for voice packets under one negotiated mode.
///
/// Packet layout: `header | tag | ciphertext | suffix`, where the suffix depends
/// on the mode (see [`CipherMode::suffix_len`]).
#[derive(Clone)]
pub struct PacketCipher {
    mode: CipherMode,
    cipher: XSalsa20Poly1305,
}

impl PacketCipher {
    pub fn new(mode: CipherMode, key: &[u8]) -> Result<Self, CryptoError> {
        let cipher =
            XSalsa20Poly1305::new_from_slice(key).map_err(|_| CryptoError::KeyLength(key.len()))?;
        Ok(Self { mode, cipher })
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    /// Writes the full encrypted packet for `header` + `payload` into `out`.
    /// `counter` is only used in lite mode.
    pub fn seal_into(
        &self,
        header: &[u8; RTP_HEADER_LEN],
        payload: &[u8],
        counter: u32,
        out: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        match self.mode {
            CipherMode::Normal => nonce[..RTP_HEADER_LEN].copy_from_slice(header),
            CipherMode::Suffix => rand::thread_rng().fill_bytes(&mut nonce),
            CipherMode::Lite => nonce[..LITE_NONCE_LEN].copy_from_slice(&counter.to_be_bytes()),
        }

        out.clear();
        out.extend_from_slice(header);
        out.resize(RTP_HEADER_LEN + TAG_SIZE, 0);
        out.extend_from_slice(payload);

        let tag = self
            .cipher
            .encrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                b"",
                &mut out[RTP_HEADER_LEN + TAG_SIZE..],
            )
            .map_err(|_| CryptoError::Authentication)?;
        out[RTP_HEADER_LEN..RTP_HEADER_LEN + TAG_SIZE].copy_from_slice(&tag);
        out.extend_from_slice(&nonce[..self.mode.suffix_len()]);
        Ok(())
    }

    /// Verifies and decrypts a full packet, returning the plaintext payload.
    pub fn open(&self, packet: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let suffix_len = self.mode.suffix_len();
        if packet.len() < RTP_HEADER_LEN + TAG_SIZE + suffix_len {
            return Err(CryptoError::PacketTooShort(packet.len()));
        }
        let (body, suffix) = packet.split_at(packet.len() - suffix_len);

        let mut nonce = [0u8; NONCE_SIZE];
        match self.mode {
            CipherMode::Normal => nonce[..RTP_HEADER_LEN].copy_from_slice(&body[..RTP_HEADER_LEN]),
            CipherMode::Suffix | CipherMode::Lite => nonce[..suffix_len].copy_from_slice(suffix),
        }

        let tag = Tag::from_slice(&body[RTP_HEADER_LEN..RTP_HEADER_LEN + TAG_SIZE]);
        let mut plain = body[RTP_HEADER_LEN + TAG_SIZE..].to_vec();
        self.cipher
            .decrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut plain, tag)
            .map_err(|_| CryptoError::Authentication)?;
        Ok(plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_SIZE] = [7; KEY_SIZE];
    const HEADER: [u8; RTP_HEADER_LEN] = [0x80, 0x78, 0, 1, 0, 0, 3, 192, 0, 0, 0, 42];

    #[test]
    fn every_mode_round_trips() {
        let payload = b"\xf8\xff\xfe opus frame bytes";
        for mode in CipherMode::ALL {
            let cipher = PacketCipher::new(mode, &KEY).unwrap();
            let mut packet = Vec::new();
            cipher.seal_into(&HEADER, payload, 0xDEAD_BEEF, &mut packet).unwrap();

            assert_eq!(&packet[..RTP_HEADER_LEN], &HEADER, "{mode}");
            assert_eq!(
                packet.len(),
                RTP_HEADER_LEN + TAG_SIZE + payload.len() + mode.suffix_len()
            );
            assert_ne!(&packet[RTP_HEADER_LEN + TAG_SIZE..][..payload.len()], payload);
            assert_eq!(cipher.open(&packet).unwrap(), payload, "{mode}");
        }
    }

    #[test]
    fn lite_suffix_is_big_endian_counter() {
        let cipher = PacketCipher::new(CipherMode::Lite, &KEY).unwrap();
        let mut packet = Vec::new();
        cipher.seal_into(&HEADER, b"abc", 0x0102_0304, &mut packet).unwrap();
        assert_eq!(&packet[packet.len() - 4..], &[1, 2, 3, 4]);
    }

    #[test]
    fn normal_mode_is_deterministic_for_a_header() {
        let cipher = PacketCipher::new(CipherMode::Normal, &KEY).unwrap();
        let (mut a, mut b) = (Vec::new(), Vec::new());
        cipher.seal_into(&HEADER, b"abc", 0, &mut a).unwrap();
        cipher.seal_into(&HEADER, b"abc", 99, &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tampering_is_detected() {
        for mode in CipherMode::ALL {
            let cipher = PacketCipher::new(mode, &KEY).unwrap();
            let mut packet = Vec::new();
            cipher.seal_into(&HEADER, b"payload", 5, &mut packet).unwrap();
            packet[RTP_HEADER_LEN + TAG_SIZE] ^= 1;
            assert_eq!(cipher.open(&packet), Err(CryptoError::Authentication));
        }
    }

    #[test]
    fn wrong_key_and_short_packets_fail() {
        let sealer = PacketCipher::new(CipherMode::Suffix, &KEY).unwrap();
        let opener = PacketCipher::new(CipherMode::Suffix, &[8; KEY_SIZE]).unwrap();
        let mut packet = Vec::new();
        sealer.seal_into(&HEADER, b"payload", 0, &mut packet).unwrap();
        assert_eq!(opener.open(&packet), Err(CryptoError::Authentication));
        assert_eq!(opener.open(&packet[..20]), Err(CryptoError::PacketTooShort(20)));
        assert!(matches!(
            PacketCipher::new(CipherMode::Lite, &[0; 16]),
            Err(CryptoError::KeyLength(16))
        ));
    }

    #[test]
    fn negotiation_follows_preference_order() {
        let offered = ["xsalsa20_poly1305", "xsalsa20_poly1305_suffix", "aead_aes256_gcm"];
        assert_eq!(
            CipherMode::negotiate(&CipherMode::ALL, &offered),
            Some(CipherMode::Suffix)
        );
        assert_eq!(
            CipherMode::negotiate(&[CipherMode::Normal], &offered),
            Some(CipherMode::Normal)
        );
        assert_eq!(CipherMode::negotiate(&[CipherMode::Lite], &["aead_aes256_gcm"]), None);
        assert_eq!(CipherMode::from_name("xsalsa20_poly1305_lite"), Some(CipherMode::Lite));
    }
}
