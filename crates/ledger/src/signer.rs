//! Batch signing with the manager owner's key.
//!
//! Key material is loaded from one of the configured sources and held in a
//! `SecretString`; it never appears in `Debug` output or logs.

use comet_keeper_core::{Address, KeeperError, Result, SignerConfig};
use k256::ecdsa::{signature::Signer, Signature, SigningKey};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use zeroize::Zeroizing;

const PRIVATE_KEY_HEX_LEN: usize = 64;

/// Signs batch digests on behalf of the manager owner.
pub struct KeeperSigner {
    private_key: SecretString,
    authority: Address,
}

impl std::fmt::Debug for KeeperSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeeperSigner")
            .field("authority", &self.authority)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct RemoteSecret {
    secret: String,
}

impl KeeperSigner {
    /// Loads the key from the configured source.
    ///
    /// # Errors
    /// Returns `KeeperError::Configuration` if the source is missing or the
    /// key is malformed, `KeeperError::Network` if the remote store is unreachable.
    pub async fn load(config: &SignerConfig) -> Result<Self> {
        let raw = match config {
            SignerConfig::Env { var } => std::env::var(var)
                .map_err(|_| KeeperError::config(format!("signer key env var {var} not set")))?,
            SignerConfig::File { path } => std::fs::read_to_string(path).map_err(|e| {
                KeeperError::config(format!("cannot read signer key {}: {e}", path.display()))
            })?,
            SignerConfig::Remote { url, token_env } => fetch_remote(url, token_env.as_deref()).await?,
        };
        let raw = Zeroizing::new(raw);
        Self::from_hex(raw.trim())
    }

    /// Builds a signer from a hex-encoded secp256k1 key.
    ///
    /// # Errors
    /// Returns `KeeperError::Configuration` if the key is not 32 bytes of hex.
    pub fn from_hex(key: &str) -> Result<Self> {
        let key_hex = key.strip_prefix("0x").unwrap_or(key);
        if key_hex.len() != PRIVATE_KEY_HEX_LEN || !key_hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(KeeperError::config(format!(
                "signer key must be {PRIVATE_KEY_HEX_LEN} hex characters"
            )));
        }
        let signing_key = signing_key(key_hex)?;
        let public = signing_key.verifying_key().to_encoded_point(true);
        Ok(Self {
            private_key: SecretString::from(key_hex.to_string()),
            authority: Address::from_hashed(public.as_bytes()),
        })
    }

    /// Address derived from the public key.
    #[must_use]
    pub const fn authority(&self) -> Address {
        self.authority
    }

    /// Signs a 32-byte digest, returning the hex-encoded signature.
    ///
    /// # Errors
    /// Returns `KeeperError::Signing` if the stored key cannot be decoded.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<String> {
        let key = signing_key(self.private_key.expose_secret())?;
        let signature: Signature = key.sign(digest);
        Ok(hex::encode(signature.to_bytes()))
    }
}

fn signing_key(key_hex: &str) -> Result<SigningKey> {
    let bytes = Zeroizing::new(
        hex::decode(key_hex).map_err(|e| KeeperError::Signing(format!("invalid key hex: {e}")))?,
    );
    SigningKey::from_slice(&bytes)
        .map_err(|e| KeeperError::Signing(format!("invalid secp256k1 key: {e}")))
}

async fn fetch_remote(url: &str, token_env: Option<&str>) -> Result<String> {
    let client = reqwest::Client::new();
    let mut request = client.get(url).header("Accept", "application/json");
    if let Some(var) = token_env {
        let token = std::env::var(var)
            .map_err(|_| KeeperError::config(format!("secret store token env var {var} not set")))?;
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .map_err(|e| KeeperError::Network(format!("secret store unreachable: {e}")))?;
    if !response.status().is_success() {
        return Err(KeeperError::config(format!(
            "secret store returned {}",
            response.status()
        )));
    }
    let body: RemoteSecret = response
        .json()
        .await
        .map_err(|e| KeeperError::Serialization(format!("secret store response: {e}")))?;
    tracing::info!(url, "Loaded signer key from secret store");
    Ok(body.secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::{signature::Verifier, VerifyingKey};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn rejects_short_keys() {
        assert!(KeeperSigner::from_hex("abcd").is_err());
    }

    #[test]
    fn debug_does_not_expose_key() {
        let signer = KeeperSigner::from_hex(KEY).unwrap();
        let debug = format!("{signer:?}");
        assert!(!debug.contains(KEY));
    }

    #[test]
    fn signature_verifies_against_public_key() {
        let signer = KeeperSigner::from_hex(KEY).unwrap();
        let digest = [7u8; 32];
        let sig_hex = signer.sign_digest(&digest).unwrap();

        let key = SigningKey::from_slice(&hex::decode(KEY).unwrap()).unwrap();
        let verifying = VerifyingKey::from(&key);
        let sig = Signature::from_slice(&hex::decode(sig_hex).unwrap()).unwrap();
        assert!(verifying.verify(&digest, &sig).is_ok());
    }

    #[tokio::test]
    async fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keeper.key");
        std::fs::write(&path, format!("0x{KEY}\n")).unwrap();

        let signer = KeeperSigner::load(&SignerConfig::File { path }).await.unwrap();
        assert_eq!(signer.authority(), KeeperSigner::from_hex(KEY).unwrap().authority());
    }

    #[tokio::test]
    async fn loads_from_remote_store() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/keeper"))
            .and(header("Authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "secret": KEY
            })))
            .mount(&server)
            .await;

        std::env::set_var("KEEPER_TEST_STORE_TOKEN", "s3cret");
        let config = SignerConfig::Remote {
            url: format!("{}/v1/keeper", server.uri()),
            token_env: Some("KEEPER_TEST_STORE_TOKEN".to_string()),
        };
        let signer = KeeperSigner::load(&config).await.unwrap();
        assert_eq!(signer.authority(), KeeperSigner::from_hex(KEY).unwrap().authority());
    }

    #[tokio::test]
    async fn missing_env_var_is_configuration_error() {
        let config = SignerConfig::Env {
            var: "KEEPER_TEST_KEY_THAT_IS_NOT_SET".to_string(),
        };
        let err = KeeperSigner::load(&config).await.unwrap_err();
        assert!(matches!(err, KeeperError::Configuration(_)));
    }
}
