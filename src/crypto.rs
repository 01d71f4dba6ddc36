/*!
Credential-at-rest encryption and session token signing.
*/
use ring::aead::BoundKey;

use crate::error::Result;
use crate::{se, CONFIG};

/// A hex encoded AES_256_GCM ciphertext and the hex encoded nonce it
/// was sealed with. Both halves are stored next to each other.
pub struct Enc {
    pub value: String,
    pub nonce: String,
}

/// ring requires an implementor of `NonceSequence`, which is a wrapping
/// trait around `ring::aead::Nonce`. We have to make a wrapper that can
/// pass ownership of the nonce exactly once.
struct OneNonceSequence {
    inner: Option<ring::aead::Nonce>,
}
impl OneNonceSequence {
    fn new(inner: ring::aead::Nonce) -> Self {
        Self { inner: Some(inner) }
    }
}

impl ring::aead::NonceSequence for OneNonceSequence {
    fn advance(&mut self) -> std::result::Result<ring::aead::Nonce, ring::error::Unspecified> {
        self.inner.take().ok_or(ring::error::Unspecified)
    }
}

/// Return a `Vec` of secure random bytes of size `n`
pub fn rand_bytes(n: usize) -> Result<Vec<u8>> {
    use ring::rand::SecureRandom;
    let mut buf = vec![0; n];
    let sysrand = ring::rand::SystemRandom::new();
    sysrand
        .fill(&mut buf)
        .map_err(|_| se!("error getting random bytes"))?;
    Ok(buf)
}

fn new_nonce() -> Result<Vec<u8>> {
    rand_bytes(12)
}

/// Seal a plaintext credential with the application key, producing the
/// pair of hex strings that goes into the store.
pub fn encrypt_str(s: &str) -> Result<Enc> {
    let nonce = new_nonce()?;
    let sealed = seal(s.as_bytes(), &nonce, CONFIG.enc_key.as_bytes())?;
    Ok(Enc {
        value: hex::encode(&sealed),
        nonce: hex::encode(&nonce),
    })
}

/// Reverse of `encrypt_str`.
pub fn decrypt_str(enc: &Enc) -> Result<String> {
    let nonce = hex::decode(&enc.nonce).map_err(|e| se!("nonce hex decode error {}", e))?;
    let mut value = hex::decode(&enc.value).map_err(|e| se!("value hex decode error {}", e))?;
    let bytes = open(value.as_mut_slice(), &nonce, CONFIG.enc_key.as_bytes())?;
    String::from_utf8(bytes.to_vec()).map_err(|e| se!("decrypted value is not utf8 {}", e))
}

pub fn hmac_sign(s: &str) -> String {
    // using a 32 byte key
    let s_key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, CONFIG.enc_key.as_bytes());
    let tag = ring::hmac::sign(&s_key, s.as_bytes());
    hex::encode(&tag)
}

/// Return the SHA256 hash of `bytes`
pub fn hash(bytes: &[u8]) -> Vec<u8> {
    let alg = &ring::digest::SHA256;
    let digest = ring::digest::digest(alg, bytes);
    Vec::from(digest.as_ref())
}

/// `bytes` are encrypted using AES_256_GCM, `nonce` is expected to be
/// 12-bytes, and `pass` 32-bytes
fn seal(bytes: &[u8], nonce: &[u8], pass: &[u8]) -> Result<Vec<u8>> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| se!("encryption nonce not unique"))?;
    let nonce = OneNonceSequence::new(nonce);
    let key =
        ring::aead::UnboundKey::new(alg, pass).map_err(|_| se!("error building sealing key"))?;
    let mut key = ring::aead::SealingKey::new(key, nonce);
    let mut in_out = bytes.to_vec();
    key.seal_in_place_append_tag(ring::aead::Aad::empty(), &mut in_out)
        .map_err(|_| se!("failed encrypting bytes"))?;
    Ok(in_out)
}

fn open<'a>(bytes: &'a mut [u8], nonce: &[u8], pass: &[u8]) -> Result<&'a [u8]> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| se!("decryption nonce not unique"))?;
    let nonce = OneNonceSequence::new(nonce);
    let key =
        ring::aead::UnboundKey::new(alg, pass).map_err(|_| se!("error building opening key"))?;
    let mut key = ring::aead::OpeningKey::new(key, nonce);
    let out_slice = key
        .open_in_place(ring::aead::Aad::empty(), bytes)
        .map_err(|_| se!("failed decrypting bytes"))?;
    Ok(out_slice)
}
