use rand::RngCore;
use sha2::{Digest, Sha256};

/// Prefix on every ingest API key.
pub const KEY_PREFIX: &str = "proj_";
/// Characters of the key shown in UIs after creation.
const PREVIEW_CHARS: usize = 8;

/// A freshly generated ingest key. The plaintext exists only in this value;
/// callers show it to the operator once and persist hash + preview.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub plaintext: String,
    pub hash: String,
    pub preview: String,
}

/// Generate a `proj_<hex>` API key with 32 bytes of entropy.
pub fn generate_api_key() -> GeneratedKey {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let plaintext = format!("{KEY_PREFIX}{}", hex::encode(bytes));
    GeneratedKey {
        hash: hash_api_key(&plaintext),
        preview: preview_of(&plaintext),
        plaintext,
    }
}

/// SHA-256 of the full key string, hex-encoded. Only this is stored.
pub fn hash_api_key(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

/// Last characters of the key, for display and for auth-failure logs.
pub fn preview_of(plaintext: &str) -> String {
    let chars: Vec<char> = plaintext.chars().collect();
    let start = chars.len().saturating_sub(PREVIEW_CHARS);
    chars[start..].iter().collect()
}
