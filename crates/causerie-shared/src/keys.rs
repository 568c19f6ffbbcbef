use std::fs;
use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::KeyError;

/// The server's VAPID key pair (ES256 on P-256).
///
/// The public key is handed to clients so they can create push
/// subscriptions; the private key signs the authorization token presented
/// to push providers.  The pair is generated once and persisted, because
/// rotating it silently would invalidate every existing subscription.
#[derive(Clone)]
pub struct VapidKeys {
    signing: SigningKey,
}

/// On-disk format: base64url raw keys, the same shape the original
/// deployment's key file used.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VapidKeyFile {
    public_key: String,
    private_key: String,
}

impl VapidKeys {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::random(&mut OsRng),
        }
    }

    /// Restore a key pair from raw private scalar bytes.
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let signing = SigningKey::from_slice(bytes)
            .map_err(|_| KeyError::Malformed("invalid private key bytes".to_string()))?;
        Ok(Self { signing })
    }

    /// Load the key pair from `path`, generating and persisting a new one
    /// when the file does not exist yet.  Any read, write, or parse failure
    /// is an error; the caller treats it as fatal.
    pub fn load_or_generate(path: &Path) -> Result<Self, KeyError> {
        if path.exists() {
            let raw = fs::read_to_string(path)?;
            let file: VapidKeyFile = serde_json::from_str(&raw)
                .map_err(|e| KeyError::Malformed(format!("unparseable key file: {e}")))?;
            let private = URL_SAFE_NO_PAD
                .decode(file.private_key.trim())
                .map_err(|e| KeyError::Malformed(format!("bad private key encoding: {e}")))?;
            let keys = Self::from_private_bytes(&private)?;
            if keys.public_key_b64() != file.public_key.trim() {
                return Err(KeyError::Malformed(
                    "public key does not match private key".to_string(),
                ));
            }
            Ok(keys)
        } else {
            let keys = Self::generate();
            let file = VapidKeyFile {
                public_key: keys.public_key_b64(),
                private_key: URL_SAFE_NO_PAD.encode(keys.signing.to_bytes()),
            };
            let raw = serde_json::to_string_pretty(&file)
                .map_err(|e| KeyError::Malformed(e.to_string()))?;
            fs::write(path, raw)?;
            Ok(keys)
        }
    }

    /// Uncompressed SEC1 public key point, base64url without padding: the
    /// exact string clients pass as `applicationServerKey` and the `k`
    /// parameter of the VAPID authorization header.
    pub fn public_key_b64(&self) -> String {
        let verifying: &VerifyingKey = self.signing.verifying_key();
        URL_SAFE_NO_PAD.encode(verifying.to_encoded_point(false).as_bytes())
    }

    /// ES256 signature over `message` as the raw 64-byte `r || s` form JWS
    /// expects.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing.sign(message);
        signature.to_bytes().to_vec()
    }
}
