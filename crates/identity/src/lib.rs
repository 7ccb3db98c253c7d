//! C1 Identity — holds the worker's asymmetric keypair and signs the
//! claim/ping/finish envelopes sent to the Gateway (spec.md §4, C1).
//!
//! The key material is read-only after init (spec.md §5 "Shared-resource
//! policy"); only the job-completion counters in the identity file are
//! mutated during the worker's lifetime.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityFile {
    encoder_id: String,
    display_name: String,
    created_at: DateTime<Utc>,
    total_jobs_completed: u64,
    last_active: DateTime<Utc>,
    secret_key_b64: String,
}

/// A signed envelope: `{jws: <header>.<payload>.<signature>}`, all three
/// parts base64url-encoded, which the Gateway API expects to wrap every
/// write operation (spec.md §4.1, §6).
#[derive(Debug, Clone)]
pub struct SignedEnvelope {
    compact: String,
}

impl SignedEnvelope {
    /// The request body shape the Gateway expects: `{"jws": "..."}`.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({ "jws": self.compact })
    }
}

pub struct Identity {
    signing_key: SigningKey,
    file: IdentityFile,
    path: PathBuf,
}

impl Identity {
    /// Loads the identity file at `path`, creating a fresh keypair and
    /// file if absent (spec.md §6 "Persistent worker state").
    pub fn load_or_create(path: impl Into<PathBuf>, display_name: &str) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create identity dir {}", parent.display()))?;
        }

        if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("read identity file {}", path.display()))?;
            let file: IdentityFile =
                serde_json::from_str(&raw).context("parse identity file")?;
            let key_bytes = B64
                .decode(file.secret_key_b64.as_bytes())
                .context("decode identity secret key")?;
            let key_bytes: [u8; 32] = key_bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("identity secret key is not 32 bytes"))?;
            let signing_key = SigningKey::from_bytes(&key_bytes);
            return Ok(Self {
                signing_key,
                file,
                path,
            });
        }

        let signing_key = SigningKey::generate(&mut OsRng);
        let now = Utc::now();
        let file = IdentityFile {
            encoder_id: uuid_like(&signing_key.verifying_key()),
            display_name: display_name.to_string(),
            created_at: now,
            total_jobs_completed: 0,
            last_active: now,
            secret_key_b64: B64.encode(signing_key.to_bytes()),
        };
        let identity = Self {
            signing_key,
            file,
            path,
        };
        identity.persist()?;
        Ok(identity)
    }

    fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.file)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn encoder_id(&self) -> &str {
        &self.file.encoder_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Canonical `did:key:<base64url public key>` form (spec.md §4.2, §9).
    pub fn did(&self) -> String {
        format!(
            "did:key:{}",
            B64.encode(self.verifying_key().to_bytes())
        )
    }

    /// Signs `payload` and wraps it as the Gateway's expected envelope.
    pub fn sign_envelope(&self, payload: &impl Serialize) -> Result<SignedEnvelope> {
        let payload_json = serde_json::to_vec(payload)?;
        let payload_b64 = B64.encode(&payload_json);
        let header_b64 = B64.encode(br#"{"alg":"EdDSA","typ":"JWT"}"#);
        let signing_input = format!("{header_b64}.{payload_b64}");
        let signature = self.signing_key.sign(signing_input.as_bytes());
        let compact = format!(
            "{signing_input}.{}",
            B64.encode(signature.to_bytes())
        );
        Ok(SignedEnvelope { compact })
    }

    /// Bumps the completion counters and persists them; called by the
    /// engine on every successful Finish/Complete (SPEC_FULL.md §2 C1).
    pub fn record_job_completed(&mut self) -> Result<()> {
        self.file.total_jobs_completed += 1;
        self.file.last_active = Utc::now();
        self.persist()
    }

    pub fn total_jobs_completed(&self) -> u64 {
        self.file.total_jobs_completed
    }
}

fn uuid_like(key: &VerifyingKey) -> String {
    let bytes = key.to_bytes();
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
    )
}

pub fn verify_envelope(compact: &str, expected_key: &VerifyingKey) -> Result<Vec<u8>> {
    let mut parts = compact.splitn(3, '.');
    let (Some(header_b64), Some(payload_b64), Some(sig_b64)) =
        (parts.next(), parts.next(), parts.next())
    else {
        anyhow::bail!("malformed envelope");
    };
    let signing_input = format!("{header_b64}.{payload_b64}");
    let sig_bytes = B64.decode(sig_b64.as_bytes()).context("decode signature")?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("signature is not 64 bytes"))?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    expected_key
        .verify_strict(signing_input.as_bytes(), &signature)
        .context("signature verification failed")?;
    B64.decode(payload_b64.as_bytes()).context("decode payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    #[test]
    fn creates_and_reloads_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encoder-identity");
        assert!(!path.exists());

        let identity = Identity::load_or_create(&path, "test-worker").unwrap();
        let did_a = identity.did();
        drop(identity);

        let identity2 = Identity::load_or_create(&path, "test-worker").unwrap();
        assert_eq!(identity2.did(), did_a);
    }

    #[test]
    fn signs_envelope_verifiably() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encoder-identity");
        let identity = Identity::load_or_create(&path, "test-worker").unwrap();

        let payload = serde_json::json!({"job_id": "abc"});
        let envelope = identity.sign_envelope(&payload).unwrap();
        let body = envelope.to_body();
        let jws = body["jws"].as_str().unwrap();

        let decoded = verify_envelope(jws, &identity.verifying_key()).unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(decoded, payload);

        // Sanity-check the raw dalek signature path used internally.
        let mut parts = jws.splitn(3, '.');
        let header = parts.next().unwrap();
        let payload_part = parts.next().unwrap();
        let sig_part = parts.next().unwrap();
        let sig_bytes = B64.decode(sig_part).unwrap();
        let sig_bytes: [u8; 64] = sig_bytes.try_into().unwrap();
        let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        assert!(identity
            .verifying_key()
            .verify(format!("{header}.{payload_part}").as_bytes(), &sig)
            .is_ok());
    }

    #[test]
    fn records_job_completion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encoder-identity");
        let mut identity = Identity::load_or_create(&path, "test-worker").unwrap();
        assert_eq!(identity.total_jobs_completed(), 0);
        identity.record_job_completed().unwrap();
        assert_eq!(identity.total_jobs_completed(), 1);

        let reloaded = Identity::load_or_create(&path, "test-worker").unwrap();
        assert_eq!(reloaded.total_jobs_completed(), 1);
    }
}
