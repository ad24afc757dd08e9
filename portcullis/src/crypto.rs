//! Random token generation and HMAC-SHA256 signing helpers.
//!
//! Everything that needs to prove it was minted by this process (session cookies, federated
//! relay state, CSRF tokens) goes through [`Signer`]. Signatures are URL-safe base64 without
//! padding so they can travel in cookies, query strings and headers unchanged.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use rand::prelude::RngExt;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Generates `N` bytes of cryptographically secure random data, base64url encoded.
///
/// ```
/// use portcullis::crypto::random_token;
///
/// let token = random_token::<32>();
/// assert_eq!(token.len(), 43);
/// ```
pub fn random_token<const N: usize>() -> String {
    let bytes: [u8; N] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// HMAC-SHA256 signer over a fixed key.
#[derive(Clone)]
pub struct Signer {
    key: Vec<u8>,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self { key: key.as_ref().to_vec() }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length, so this cannot fail
        match HmacSha256::new_from_slice(&self.key) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC-SHA256 accepts keys of any length"),
        }
    }

    /// Sign `message`, returning the base64url encoded MAC.
    pub fn sign(&self, message: &str) -> String {
        let mut mac = self.mac();
        mac.update(message.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Verify a signature produced by [`Signer::sign`] in constant time.
    pub fn verify(&self, message: &str, signature: &str) -> bool {
        let Ok(expected) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        let mut mac = self.mac();
        mac.update(message.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    /// Produce `{message}.{signature}`.
    pub fn seal(&self, message: &str) -> String {
        format!("{}.{}", message, self.sign(message))
    }

    /// Split a value produced by [`Signer::seal`] and return the message if the signature holds.
    ///
    /// The signature is taken from after the last `.` so sealed messages may themselves
    /// contain dots.
    pub fn unseal<'a>(&self, sealed: &'a str) -> Option<&'a str> {
        let (message, signature) = sealed.rsplit_once('.')?;
        self.verify(message, signature).then_some(message)
    }
}
