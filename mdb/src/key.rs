use crate::error::{AdbError, AdbResult};
use crate::pubkey::AndroidPublicKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::{Hash, PaddingScheme, RsaPrivateKey, RsaPublicKey};
use std::path::Path;

const KEY_BITS: usize = 2048;

/// Owns an RSA-2048 keypair plus the human-readable name ADB sends as a
/// hint alongside the public key in the last AUTH round. Read-only for the
/// lifetime of any connection built from it; safe to share across
/// connections.
#[derive(Clone)]
pub struct AdbKey {
    private: RsaPrivateKey,
    name: String,
}

impl AdbKey {
    /// Generates a fresh identity. Used when a caller has no persisted
    /// `adbkey` yet.
    pub fn generate(name: impl Into<String>) -> AdbResult<Self> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| AdbError::Protocol(format!("key generation failed: {}", e)))?;
        Ok(Self {
            private,
            name: name.into(),
        })
    }

    /// Loads a PKCS#8 PEM-encoded private key, the format `adb keygen`
    /// writes to `~/.android/adbkey`.
    pub fn from_pkcs8_pem(pem: &str, name: impl Into<String>) -> AdbResult<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| AdbError::Protocol(format!("invalid private key: {}", e)))?;
        Ok(Self {
            private,
            name: name.into(),
        })
    }

    /// Loads `~/.android/adbkey`, generating and persisting a fresh key
    /// there if none exists yet — mirroring the on-disk convention real
    /// `adb` clients use.
    pub fn load_or_generate(name: impl Into<String>) -> AdbResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| AdbError::Protocol("no home directory".into()))?;
        let path = home.join(".android").join("adbkey");
        let name = name.into();
        if path.exists() {
            let pem = std::fs::read_to_string(&path)?;
            Self::from_pkcs8_pem(&pem, name)
        } else {
            let key = Self::generate(name)?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            key.write_pkcs8_pem(&path)?;
            Ok(key)
        }
    }

    fn write_pkcs8_pem(&self, path: &Path) -> AdbResult<()> {
        let doc = self
            .private
            .to_pkcs8_der()
            .map_err(|e| AdbError::Protocol(format!("encoding private key: {}", e)))?;
        let pem = pem::encode(&pem::Pem {
            tag: "PRIVATE KEY".into(),
            contents: doc.as_ref().to_vec(),
        });
        std::fs::write(path, pem)?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn public_key(&self) -> RsaPublicKey {
        RsaPublicKey::from(&self.private)
    }

    /// PKCS#1-v1.5/SHA-1 signature over a raw, already-20-byte digest — the
    /// AUTH token is passed straight through, never re-hashed.
    pub fn sign(&self, token: &[u8]) -> AdbResult<Vec<u8>> {
        let padding = PaddingScheme::new_pkcs1v15_sign(Some(Hash::SHA1));
        self.private
            .sign(padding, token)
            .map_err(|e| AdbError::Protocol(format!("signing failed: {}", e)))
    }

    /// The Android public-key blob, base64-encoded and NUL-terminated,
    /// without the trailing `" name\0"` AUTH-3 expects — callers append
    /// that themselves since the blob is also used for `adbkey.pub` files.
    pub fn public_blob(&self) -> AdbResult<String> {
        AndroidPublicKey::new(&self.public_key())
            .encode()
            .map_err(|e| AdbError::Protocol(format!("encoding public key: {}", e)))
    }

    /// Raw PKCS#8 DER bytes of the private key, used to derive a
    /// self-signed certificate for the TLS pairing channel.
    pub fn pkcs8_der(&self) -> AdbResult<Vec<u8>> {
        let doc = self
            .private
            .to_pkcs8_der()
            .map_err(|e| AdbError::Protocol(format!("encoding private key: {}", e)))?;
        Ok(doc.as_ref().to_vec())
    }
}

impl std::fmt::Debug for AdbKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbKey").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_produces_256_byte_signature() -> AdbResult<()> {
        let key = AdbKey::generate("unit-test")?;
        let token = [0u8; 20];
        let sig = key.sign(&token)?;
        assert_eq!(sig.len(), 256);
        Ok(())
    }

    #[test]
    fn public_blob_is_nul_terminated() -> AdbResult<()> {
        let key = AdbKey::generate("unit-test")?;
        let blob = key.public_blob()?;
        assert!(blob.ends_with('\0'));
        Ok(())
    }
}
