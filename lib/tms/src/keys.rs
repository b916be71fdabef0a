//! Key pair lifecycle
//!
//! Key pairs live in the token under a caller-chosen label; the owner of each
//! label is recorded in the [`KeyRegistry`]. The two systems are updated one
//! after the other without a coordinator, so a failure between the steps is
//! reported as [`TmsError::RegistryInconsistent`] rather than hidden.
//!
//! A token cannot enforce label uniqueness, so [`KeyManager`] serializes
//! generate and delete per label.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::error::TmsError;
use crate::hsm::{
    Hsm, HsmError, KeyAttribute, KeyClass, KeyGenMechanism, KeyType, ObjectHandle, StepOutcome,
    TokenSession,
};
use crate::store::KeyRegistry;

pub const RSA_MODULUS_BITS: u64 = 2048;
pub const RSA_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

const GENERATE_STEP: &str = "generate key pair";
const DELETE_STEP: &str = "delete key pair";

/// Public half: RSA-2048, e = 65537, persistent, usable for encrypt/verify.
pub fn public_key_template(label: &str) -> Vec<KeyAttribute> {
    vec![
        KeyAttribute::Class(KeyClass::Public),
        KeyAttribute::KeyType(KeyType::Rsa),
        KeyAttribute::Token(true),
        KeyAttribute::Encrypt(true),
        KeyAttribute::Verify(true),
        KeyAttribute::PublicExponent(RSA_PUBLIC_EXPONENT.to_vec()),
        KeyAttribute::ModulusBits(RSA_MODULUS_BITS),
        KeyAttribute::Label(label.as_bytes().to_vec()),
    ]
}

/// Private half: persistent, private, sensitive, usable for decrypt/sign.
pub fn private_key_template(label: &str) -> Vec<KeyAttribute> {
    vec![
        KeyAttribute::Class(KeyClass::Private),
        KeyAttribute::KeyType(KeyType::Rsa),
        KeyAttribute::Token(true),
        KeyAttribute::Private(true),
        KeyAttribute::Sensitive(true),
        KeyAttribute::Decrypt(true),
        KeyAttribute::Sign(true),
        KeyAttribute::Label(label.as_bytes().to_vec()),
    ]
}

/// Find the key object with exactly this label and class.
pub fn find_key_by_label(
    session: &mut dyn TokenSession,
    label: &str,
    class: KeyClass,
) -> Result<ObjectHandle, HsmError> {
    let template = [
        KeyAttribute::Class(class),
        KeyAttribute::Label(label.as_bytes().to_vec()),
    ];
    session
        .find_objects(&template)?
        .into_iter()
        .next()
        .ok_or_else(|| HsmError::KeyNotFound {
            label: label.to_string(),
            class,
        })
}

fn key_exists(session: &mut dyn TokenSession, label: &str) -> Result<bool, HsmError> {
    match find_key_by_label(session, label, KeyClass::Private) {
        Ok(_) => Ok(true),
        Err(HsmError::KeyNotFound { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Generate a labeled RSA key pair in the token. Returns `(public, private)`.
pub fn create_key_pair(
    session: &mut dyn TokenSession,
    label: &str,
) -> Result<(ObjectHandle, ObjectHandle), HsmError> {
    session.generate_key_pair(
        KeyGenMechanism::RsaPkcsKeyPairGen,
        &public_key_template(label),
        &private_key_template(label),
    )
}

/// Both halves of a key pair as `(public, private)`.
pub fn find_key_pair(
    session: &mut dyn TokenSession,
    label: &str,
) -> Result<(ObjectHandle, ObjectHandle), HsmError> {
    let public = find_key_by_label(session, label, KeyClass::Public)?;
    let private = find_key_by_label(session, label, KeyClass::Private)?;
    Ok((public, private))
}

/// Destroy both halves of a key pair. Both must exist before either is destroyed.
pub fn destroy_key_pair(session: &mut dyn TokenSession, label: &str) -> Result<(), HsmError> {
    let (public, private) = find_key_pair(session, label)?;
    session.destroy_object(public)?;
    session.destroy_object(private)
}

/// Labels of every private key in the token, sorted and deduplicated.
pub fn list_key_labels(session: &mut dyn TokenSession) -> Result<Vec<String>, HsmError> {
    let handles = session.find_objects(&[KeyAttribute::Class(KeyClass::Private)])?;

    let mut labels = Vec::new();
    for handle in handles {
        if let Some(label) = session.object_label(handle)? {
            labels.push(label);
        }
    }
    labels.sort();
    labels.dedup();
    Ok(labels)
}

fn validate(owner_id: &str, label: &str) -> Result<(), TmsError> {
    if label.is_empty() {
        return Err(TmsError::InvalidRequest("Label cannot be empty".into()));
    }
    if owner_id.is_empty() {
        return Err(TmsError::InvalidRequest("Owner id cannot be empty".into()));
    }
    Ok(())
}

/// Labels with a generate or delete in progress.
#[derive(Default)]
struct LabelLocks {
    held: Mutex<HashSet<String>>,
    released: Notify,
}

impl LabelLocks {
    /// Wait until no other operation holds `label`, then hold it.
    async fn acquire(&self, label: &str) -> LabelGuard<'_> {
        loop {
            // Registered before the check so a release in between is not missed.
            let released = self.released.notified();
            let acquired = self.held().insert(label.to_string());
            if acquired {
                return LabelGuard {
                    locks: self,
                    label: label.to_string(),
                };
            }
            released.await;
        }
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct LabelGuard<'a> {
    locks: &'a LabelLocks,
    label: String,
}

impl Drop for LabelGuard<'_> {
    fn drop(&mut self) {
        self.locks.held().remove(&self.label);
        self.locks.released.notify_waiters();
    }
}

/// Generates and deletes key pairs across the token and the key registry.
pub struct KeyManager {
    hsm: Hsm,
    registry: Arc<dyn KeyRegistry>,
    registry_timeout: Duration,
    labels: LabelLocks,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("hsm", &self.hsm)
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    pub fn new(hsm: Hsm, registry: Arc<dyn KeyRegistry>, registry_timeout: Duration) -> Self {
        Self {
            hsm,
            registry,
            registry_timeout,
            labels: LabelLocks::default(),
        }
    }

    /// Generate a key pair for `owner_id` under `label` and register it.
    ///
    /// If the registry write fails, or the token step times out after the
    /// pair was created, the pair is destroyed once as compensation and the
    /// call fails with `RegistryInconsistent`; the message says whether the
    /// token still holds the orphaned pair.
    pub async fn generate_key_pair(&self, owner_id: &str, label: &str) -> Result<(), TmsError> {
        validate(owner_id, label)?;
        let _held = self.labels.acquire(label).await;

        let key_label = label.to_string();
        let outcome = self
            .hsm
            .run_step(GENERATE_STEP, move |session, abort| {
                if key_exists(session, &key_label)? {
                    return Err(TmsError::KeyAlreadyExists(key_label));
                }
                abort.check(GENERATE_STEP)?;
                create_key_pair(session, &key_label)?;
                Ok(())
            })
            .await;

        match outcome {
            StepOutcome::Completed(result) => result?,
            StepOutcome::TimedOut(late) => {
                // Generation already in flight when the limit passed may still succeed.
                late.settle().await?;
                warn!(label, owner_id, "Key pair generated after the token step timed out");
                return Err(self
                    .compensate_orphan(label, "token step timed out during generation")
                    .await);
            }
        }

        let saved = tokio::time::timeout(
            self.registry_timeout,
            self.registry.save_key_pair(label, owner_id),
        )
        .await;
        let cause = match saved {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("registry write timed out".to_string()),
        };

        if let Some(cause) = cause {
            warn!(label, owner_id, "Key registry write failed after generation: {}", cause);
            return Err(self.compensate_orphan(label, &cause).await);
        }

        info!(label, owner_id, "Generated key pair");
        Ok(())
    }

    async fn compensate_orphan(&self, label: &str, cause: &str) -> TmsError {
        let key_label = label.to_string();
        let destroyed = self
            .hsm
            .with_session("destroy orphaned key pair", move |session, _| {
                destroy_key_pair(session, &key_label).map_err(TmsError::from)
            })
            .await;

        match destroyed {
            Ok(()) => TmsError::RegistryInconsistent(format!(
                "key pair '{}' was not registered ({}); generated keys destroyed",
                label, cause
            )),
            Err(e) => {
                error!(label, "Orphaned key pair left in token: {}", e);
                TmsError::RegistryInconsistent(format!(
                    "key pair '{}' was not registered ({}); orphaned keys remain in token: {}",
                    label, cause, e
                ))
            }
        }
    }

    /// Destroy the key pair in the token, then remove its registry entry.
    ///
    /// Token destruction is not undone if the registry step fails. If the
    /// token step times out before destroying anything, nothing is destroyed;
    /// if the destruction was already in flight, the registry step still runs.
    pub async fn delete_key_pair(&self, owner_id: &str, label: &str) -> Result<(), TmsError> {
        validate(owner_id, label)?;
        let _held = self.labels.acquire(label).await;

        let key_label = label.to_string();
        let outcome = self
            .hsm
            .run_step(DELETE_STEP, move |session, abort| {
                let (public, private) = find_key_pair(session, &key_label)?;
                abort.check(DELETE_STEP)?;
                session.destroy_object(public)?;
                session.destroy_object(private)?;
                Ok(())
            })
            .await;

        match outcome {
            StepOutcome::Completed(result) => result?,
            StepOutcome::TimedOut(late) => {
                late.settle().await?;
                warn!(label, owner_id, "Key pair destroyed after the token step timed out");
            }
        }

        let removed = tokio::time::timeout(
            self.registry_timeout,
            self.registry.delete_key_pair(owner_id, label),
        )
        .await;

        match removed {
            Ok(Ok(true)) => {
                info!(label, owner_id, "Deleted key pair");
                Ok(())
            }
            Ok(Ok(false)) => {
                warn!(label, owner_id, "Key pair destroyed but no registry entry matched");
                Err(TmsError::RegistryInconsistent(format!(
                    "key pair '{}' destroyed in token but no registry entry for owner '{}'",
                    label, owner_id
                )))
            }
            Ok(Err(e)) => {
                warn!(label, owner_id, "Key pair destroyed but registry removal failed: {}", e);
                Err(TmsError::RegistryInconsistent(format!(
                    "key pair '{}' destroyed in token but registry removal failed: {}",
                    label, e
                )))
            }
            Err(_) => {
                warn!(label, owner_id, "Key pair destroyed but registry removal timed out");
                Err(TmsError::RegistryInconsistent(format!(
                    "key pair '{}' destroyed in token but registry removal timed out",
                    label
                )))
            }
        }
    }

    /// Labels of all key pairs in the token.
    pub async fn list_keys(&self) -> Result<Vec<String>, TmsError> {
        self.hsm
            .with_session("list keys", |session, _| {
                list_key_labels(session).map_err(TmsError::from)
            })
            .await
    }

    /// Whether the token holds a key object with this label and class.
    pub async fn key_exists(&self, label: &str, class: KeyClass) -> Result<bool, TmsError> {
        let key_label = label.to_string();
        self.hsm
            .with_session("find key", move |session, _| {
                match find_key_by_label(session, &key_label, class) {
                    Ok(_) => Ok(true),
                    Err(HsmError::KeyNotFound { .. }) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }
}
