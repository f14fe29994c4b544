/// Cache cipher
///
/// Symmetric obfuscation of the partner-data cache blob with a fixed,
/// module-scoped passphrase. A SHA-256 counter-mode keystream is XORed over
/// the plaintext and the result armored in base64 behind a random nonce.
///
/// This is confidentiality-through-obscurity against casual tampering, not a
/// security boundary: the passphrase ships with the client.
use crate::error::{EngineError, EngineResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Fixed passphrase for the partner-data cache blob
const PASSPHRASE: &[u8] = b"polaris.axis.7f1c";

/// Nonce length prepended to every ciphertext
const NONCE_LEN: usize = 8;

/// Derive one 32-byte keystream block for the given nonce and counter
fn keystream_block(nonce: &[u8], counter: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(PASSPHRASE);
    hasher.update(nonce);
    hasher.update(counter.to_le_bytes());
    hasher.finalize().into()
}

/// XOR the keystream over a buffer in place
fn apply_keystream(nonce: &[u8], buf: &mut [u8]) {
    for (i, chunk) in buf.chunks_mut(32).enumerate() {
        let block = keystream_block(nonce, i as u64);
        for (byte, key) in chunk.iter_mut().zip(block.iter()) {
            *byte ^= key;
        }
    }
}

/// Encrypt a UTF-8 string into base64 armor
pub fn encrypt(plaintext: &str) -> String {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut body = plaintext.as_bytes().to_vec();
    apply_keystream(&nonce, &mut body);

    let mut out = Vec::with_capacity(NONCE_LEN + body.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&body);
    BASE64.encode(out)
}

/// Decrypt base64 armor back into the original string
///
/// Malformed armor or ciphertext that does not decrypt to valid UTF-8 yields
/// an `EngineError::Cipher`; callers treat that as "no cached data".
pub fn decrypt(ciphertext: &str) -> EngineResult<String> {
    let raw = BASE64
        .decode(ciphertext)
        .map_err(|e| EngineError::Cipher(format!("invalid armor: {}", e)))?;

    if raw.len() < NONCE_LEN {
        return Err(EngineError::Cipher("ciphertext too short".to_string()));
    }
    let (nonce, body) = raw.split_at(NONCE_LEN);

    let mut body = body.to_vec();
    apply_keystream(nonce, &mut body);

    String::from_utf8(body).map_err(|e| EngineError::Cipher(format!("invalid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for plaintext in [
            "",
            "a",
            r#"{"eids":[{"source":"polaris-id.net","uids":[{"id":"X1"}]}]}"#,
            "héllo wörld — ユニコード 🙂",
        ] {
            let ciphertext = encrypt(plaintext);
            assert_ne!(ciphertext, plaintext);
            assert_eq!(decrypt(&ciphertext).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_nonce_varies_ciphertext() {
        let a = encrypt("same plaintext");
        let b = encrypt("same plaintext");
        assert_ne!(a, b);
        assert_eq!(decrypt(&a).unwrap(), decrypt(&b).unwrap());
    }

    #[test]
    fn test_malformed_input_is_an_error_not_a_panic() {
        assert!(decrypt("not base64 at all!!!").is_err());
        assert!(decrypt(&BASE64.encode(b"tiny")).is_err());
        // The INVALID_ID sentinel is stored in place of ciphertext and must
        // decode as "no data"
        assert!(decrypt("INVALID_ID").is_err());
    }
}
