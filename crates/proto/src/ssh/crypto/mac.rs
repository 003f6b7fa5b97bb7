//! Message authentication for the transport codec.
//!
//! SSH computes the MAC over `uint32 sequence_number || unencrypted packet`
//! and appends it after the ciphertext. The codec drives a [`Mac`] instance
//! incrementally: sequence word, then the packet region, then a finalize
//! into a scratch slice.

use hmac::{Hmac, Mac as _};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use skiff_platform::{SkiffError, SkiffResult};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// An incremental packet MAC.
pub trait Mac: Send {
    /// MAC output length in bytes. Also the derived key length, per the
    /// hmac algorithm definitions.
    fn size(&self) -> usize;

    /// Installs the integrity key.
    fn init(&mut self, key: &[u8]) -> SkiffResult<()>;

    /// Feeds a big-endian `uint32` (the packet sequence number).
    fn update_u32(&mut self, value: u32);

    /// Feeds packet bytes.
    fn update(&mut self, data: &[u8]);

    /// Writes the MAC into `out` and resets for the next packet.
    fn finalize_into(&mut self, out: &mut [u8]) -> SkiffResult<()>;
}

/// Compares a computed MAC against the received one in constant time.
pub fn verify(computed: &[u8], received: &[u8]) -> SkiffResult<()> {
    if computed.len() != received.len() || computed.ct_eq(received).unwrap_u8() != 1 {
        return Err(SkiffError::Mac("MAC verification failed".to_string()));
    }
    Ok(())
}

/// MAC algorithms offered in the KEXINIT proposal, in the order listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// hmac-sha2-256 (RFC 6668)
    HmacSha256,
    /// hmac-sha2-512 (RFC 6668)
    HmacSha512,
    /// hmac-sha1 (RFC 4253)
    HmacSha1,
}

impl MacAlgorithm {
    /// Returns the SSH algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
            MacAlgorithm::HmacSha1 => "hmac-sha1",
        }
    }

    /// Parses a MAC algorithm from its SSH name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            _ => None,
        }
    }

    /// Creates an uninitialized MAC instance.
    pub fn create(&self) -> Box<dyn Mac> {
        match self {
            MacAlgorithm::HmacSha256 => Box::new(HmacSha256Mac::default()),
            MacAlgorithm::HmacSha512 => Box::new(HmacSha512Mac::default()),
            MacAlgorithm::HmacSha1 => Box::new(HmacSha1Mac::default()),
        }
    }
}

macro_rules! hmac_mac {
    ($name:ident, $digest:ty, $size:expr) => {
        #[derive(Default)]
        struct $name {
            key: Vec<u8>,
            state: Option<Hmac<$digest>>,
        }

        impl $name {
            fn state(&mut self) -> SkiffResult<&mut Hmac<$digest>> {
                if self.state.is_none() {
                    if self.key.is_empty() {
                        return Err(SkiffError::Protocol("MAC used before init".to_string()));
                    }
                    let hmac = Hmac::<$digest>::new_from_slice(&self.key).map_err(|_| {
                        SkiffError::KeyExchange("Invalid MAC key material".to_string())
                    })?;
                    self.state = Some(hmac);
                }
                Ok(self.state.as_mut().expect("state installed above"))
            }
        }

        impl Mac for $name {
            fn size(&self) -> usize {
                $size
            }

            fn init(&mut self, key: &[u8]) -> SkiffResult<()> {
                if key.len() < $size {
                    return Err(SkiffError::KeyExchange(format!(
                        "Insufficient MAC key material: expected {}, got {}",
                        $size,
                        key.len()
                    )));
                }
                self.key.zeroize();
                self.key = key[..$size].to_vec();
                self.state = None;
                Ok(())
            }

            fn update_u32(&mut self, value: u32) {
                self.update(&value.to_be_bytes());
            }

            fn update(&mut self, data: &[u8]) {
                if let Ok(state) = self.state() {
                    state.update(data);
                }
            }

            fn finalize_into(&mut self, out: &mut [u8]) -> SkiffResult<()> {
                let state = self
                    .state
                    .take()
                    .ok_or_else(|| SkiffError::Protocol("MAC finalized without data".to_string()))?;
                let result = state.finalize().into_bytes();
                out[..$size].copy_from_slice(&result[..$size]);
                Ok(())
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.key.zeroize();
            }
        }
    };
}

hmac_mac!(HmacSha256Mac, Sha256, 32);
hmac_mac!(HmacSha512Mac, Sha512, 64);
hmac_mac!(HmacSha1Mac, Sha1, 20);

#[cfg(test)]
mod tests {
    use super::*;

    fn compute(alg: MacAlgorithm, key: &[u8], seq: u32, data: &[u8]) -> Vec<u8> {
        let mut mac = alg.create();
        mac.init(key).unwrap();
        mac.update_u32(seq);
        mac.update(data);
        let mut out = vec![0u8; mac.size()];
        mac.finalize_into(&mut out).unwrap();
        out
    }

    #[test]
    fn test_algorithm_sizes() {
        assert_eq!(MacAlgorithm::HmacSha256.create().size(), 32);
        assert_eq!(MacAlgorithm::HmacSha512.create().size(), 64);
        assert_eq!(MacAlgorithm::HmacSha1.create().size(), 20);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(
            MacAlgorithm::from_name("hmac-sha2-256"),
            Some(MacAlgorithm::HmacSha256)
        );
        assert_eq!(MacAlgorithm::from_name("hmac-md5"), None);
    }

    #[test]
    fn test_mac_is_deterministic_per_sequence() {
        let key = [3u8; 32];
        let a = compute(MacAlgorithm::HmacSha256, &key, 0, b"payload");
        let b = compute(MacAlgorithm::HmacSha256, &key, 0, b"payload");
        let c = compute(MacAlgorithm::HmacSha256, &key, 1, b"payload");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_verify_accepts_equal_rejects_tampered() {
        let key = [5u8; 32];
        let mac = compute(MacAlgorithm::HmacSha256, &key, 7, b"data");

        assert!(verify(&mac, &mac).is_ok());

        let mut bad = mac.clone();
        bad[0] ^= 0x01;
        assert!(matches!(verify(&mac, &bad), Err(SkiffError::Mac(_))));
        assert!(matches!(verify(&mac, &mac[..16]), Err(SkiffError::Mac(_))));
    }

    #[test]
    fn test_init_rejects_short_key() {
        let mut mac = MacAlgorithm::HmacSha512.create();
        assert!(mac.init(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_finalize_resets_state() {
        let key = [1u8; 32];
        let mut mac = MacAlgorithm::HmacSha256.create();
        mac.init(&key).unwrap();

        mac.update(b"one");
        let mut first = vec![0u8; mac.size()];
        mac.finalize_into(&mut first).unwrap();

        mac.update(b"one");
        let mut second = vec![0u8; mac.size()];
        mac.finalize_into(&mut second).unwrap();

        assert_eq!(first, second);
    }
}
