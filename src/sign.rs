//! Artifact signing
//!
//! Produces ASCII-armored detached signatures over finished archives
//! with a PGP key loaded (and decrypted) once at startup. A missing key
//! file disables signing entirely — the service still builds, and the
//! build handler refuses to ship unsigned artifacts to clients that
//! expect signatures.

use crate::error::{SmithError, SmithResult};
use pgp::composed::{Deserializable, SignedSecretKey, StandaloneSignature};
use pgp::crypto::hash::HashAlgorithm;
use pgp::packet::{SignatureConfig, SignatureType, SignatureVersion, Subpacket, SubpacketData};
use pgp::types::{KeyTrait, SecretKeyTrait};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::warn;

/// The entity which can sign builds; its private key is decrypted
pub struct Signer {
    key: SignedSecretKey,
    password: String,
}

impl Signer {
    /// Load and unlock the signing key.
    ///
    /// A missing key file means signing is disabled: returns `Ok(None)`
    /// and logs a warning. Any other failure (unreadable key, bad
    /// password file, undecryptable key) is fatal — a present-but-broken
    /// key must never silently downgrade to unsigned builds.
    pub fn load(key_file: &Path, password_file: &Path) -> SmithResult<Option<Self>> {
        let key_reader = match File::open(key_file) {
            Ok(f) => BufReader::new(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    key_file = %key_file.display(),
                    "signing key not found; artifact signing is disabled"
                );
                return Ok(None);
            }
            Err(e) => {
                return Err(SmithError::io(
                    format!("unable to load signing key file {}", key_file.display()),
                    e,
                ))
            }
        };

        let (key, _headers) = SignedSecretKey::from_armor_single(key_reader)
            .map_err(|e| SmithError::Signing(format!("reading key file: {e}")))?;

        // the password file is only required for encrypted keys; trim
        // edge whitespace so trailing newlines don't break decryption
        let password = match std::fs::read_to_string(password_file) {
            Ok(contents) => contents.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(SmithError::io(
                    format!(
                        "unable to load key password file {}",
                        password_file.display()
                    ),
                    e,
                ))
            }
        };

        let signer = Self { key, password };
        signer
            .key
            .unlock(|| signer.password.clone(), |_| Ok(()))
            .map_err(|e| SmithError::Signing(format!("decrypting private key: {e}")))?;

        Ok(Some(signer))
    }

    /// Produce an ASCII-armored detached signature over `reader`
    pub fn sign_detached(&self, reader: impl Read) -> SmithResult<Vec<u8>> {
        let config = SignatureConfig::new_v4(
            SignatureVersion::V4,
            SignatureType::Binary,
            self.key.algorithm(),
            HashAlgorithm::SHA2_256,
            vec![
                Subpacket::regular(SubpacketData::SignatureCreationTime(chrono::Utc::now())),
                Subpacket::regular(SubpacketData::Issuer(self.key.key_id())),
            ],
            vec![],
        );

        let signature = config
            .sign(&self.key, || self.password.clone(), reader)
            .map_err(|e| SmithError::Signing(e.to_string()))?;

        StandaloneSignature::new(signature)
            .to_armored_bytes(None.into())
            .map_err(|e| SmithError::Signing(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_key_disables_signing() {
        let temp = TempDir::new().unwrap();
        let signer = Signer::load(
            &temp.path().join("signing_key.asc"),
            &temp.path().join("signing_key_password.txt"),
        )
        .unwrap();
        assert!(signer.is_none());
    }

    #[test]
    fn garbage_key_is_fatal() {
        let temp = TempDir::new().unwrap();
        let key_file = temp.path().join("signing_key.asc");
        std::fs::write(&key_file, "not a key").unwrap();
        let result = Signer::load(&key_file, &temp.path().join("signing_key_password.txt"));
        assert!(result.is_err());
    }
}
