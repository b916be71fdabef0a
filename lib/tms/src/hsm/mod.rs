//! HSM session management
//!
//! A token is reached through a [`SessionManager`], which resolves the slot
//! once and hands out authenticated [`HsmSession`]s. Each session is owned
//! by exactly one operation: it is opened, used through `&mut` access, and
//! closed when dropped. Sessions are never shared between requests, so
//! init/perform pairs on the token cannot interleave.
//!
//! Login state belongs to the token, not to a session: opening a session
//! while another is logged in joins that login, and the token logs out when
//! its last session closes.

pub mod memory;
pub mod pkcs11;

pub use memory::{MemorySessionManager, MemoryToken};
pub use pkcs11::Pkcs11SessionManager;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::error::TmsError;

#[derive(Error, Debug)]
pub enum HsmError {
    #[error("PKCS#11 library error: {0}")]
    Library(String),
    #[error("Token not found: {0}")]
    TokenNotFound(String),
    #[error("Session open failed: {0}")]
    SessionOpenFailed(String),
    #[error("Login failed: {0}")]
    LoginFailed(String),
    #[error("Key not found: {label} ({class})")]
    KeyNotFound { label: String, class: KeyClass },
    #[error("Key lookup failed: {0}")]
    LookupFailed(String),
    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),
    #[error("Object destruction failed: {0}")]
    DestroyFailed(String),
    #[error("Sign init failed: {0}")]
    SignInitFailed(String),
    #[error("Signing failed: {0}")]
    SignFailed(String),
    #[error("Verify init failed: {0}")]
    VerifyInitFailed(String),
    #[error("Verification failed: {0}")]
    VerifyFailed(String),
    #[error("Operation already active in session: {0}")]
    OperationActive(String),
}

/// Token-local identifier of a key object, valid for the session that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(u64);

impl ObjectHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyClass {
    Public,
    Private,
}

impl fmt::Display for KeyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyClass::Public => write!(f, "public"),
            KeyClass::Private => write!(f, "private"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa,
}

/// Object attributes understood by the token backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAttribute {
    Class(KeyClass),
    KeyType(KeyType),
    Token(bool),
    Private(bool),
    Sensitive(bool),
    Encrypt(bool),
    Decrypt(bool),
    Sign(bool),
    Verify(bool),
    ModulusBits(u64),
    PublicExponent(Vec<u8>),
    Label(Vec<u8>),
}

/// Returns the label carried by a template, if any.
pub fn template_label(template: &[KeyAttribute]) -> Option<&[u8]> {
    template.iter().find_map(|attr| match attr {
        KeyAttribute::Label(label) => Some(label.as_slice()),
        _ => None,
    })
}

/// Returns the class carried by a template, if any.
pub fn template_class(template: &[KeyAttribute]) -> Option<KeyClass> {
    template.iter().find_map(|attr| match attr {
        KeyAttribute::Class(class) => Some(*class),
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyGenMechanism {
    RsaPkcsKeyPairGen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignMechanism {
    /// SHA-256 digest and RSA PKCS#1 v1.5 padding as a single mechanism.
    Sha256RsaPkcs,
}

/// Operations on one authenticated token session.
///
/// Every method takes `&mut self`: a session carries token-side operation
/// state and must not be driven by two callers at once.
pub trait TokenSession: Send {
    fn generate_key_pair(
        &mut self,
        mechanism: KeyGenMechanism,
        public_template: &[KeyAttribute],
        private_template: &[KeyAttribute],
    ) -> Result<(ObjectHandle, ObjectHandle), HsmError>;

    fn find_objects(&mut self, template: &[KeyAttribute]) -> Result<Vec<ObjectHandle>, HsmError>;

    fn object_label(&mut self, handle: ObjectHandle) -> Result<Option<String>, HsmError>;

    fn destroy_object(&mut self, handle: ObjectHandle) -> Result<(), HsmError>;

    fn sign(
        &mut self,
        mechanism: SignMechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, HsmError>;

    /// `Ok(false)` when the token reports the signature as invalid.
    fn verify(
        &mut self,
        mechanism: SignMechanism,
        key: ObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, HsmError>;
}

/// An open, logged-in session. Closes when dropped, so every exit path
/// (including `?` and panics in the caller) releases the token slot.
pub struct HsmSession {
    inner: Box<dyn TokenSession>,
}

impl HsmSession {
    pub fn new(inner: Box<dyn TokenSession>) -> Self {
        Self { inner }
    }

    pub fn as_token(&mut self) -> &mut dyn TokenSession {
        self.inner.as_mut()
    }

    /// Release the session explicitly.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for HsmSession {
    fn drop(&mut self) {
        debug!("HSM session closed");
    }
}

impl fmt::Debug for HsmSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HsmSession").finish_non_exhaustive()
    }
}

/// Opens authenticated sessions against a single configured token.
pub trait SessionManager: Send + Sync {
    /// Open a read/write session and log in. Fails with `TokenNotFound`,
    /// `SessionOpenFailed` or `LoginFailed`, never leaving a session open.
    fn open(&self) -> Result<HsmSession, HsmError>;

    fn close(&self, session: HsmSession) {
        session.close();
    }
}

/// Set once the request that started a token step has given up on it,
/// either because the step timed out or because the request was dropped.
///
/// Steps made of several token calls check it between calls so that no new
/// call starts after the caller has stopped waiting.
#[derive(Debug, Clone, Default)]
pub struct Abort(Arc<AtomicBool>);

impl Abort {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// `Err(Timeout)` if the step has been abandoned.
    pub fn check(&self, step: &'static str) -> Result<(), TmsError> {
        if self.is_set() {
            return Err(TmsError::Timeout { step });
        }
        Ok(())
    }
}

struct AbortOnDrop(Abort);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.set();
    }
}

/// Result of [`Hsm::run_step`].
pub enum StepOutcome<T> {
    Completed(Result<T, TmsError>),
    /// The time limit passed. The token call in flight at that moment still
    /// runs to completion; [`LateStep::settle`] waits for it.
    TimedOut(LateStep<T>),
}

/// A timed-out step whose in-flight token call has not yet returned.
pub struct LateStep<T> {
    step: &'static str,
    task: tokio::task::JoinHandle<Result<T, TmsError>>,
}

impl<T> LateStep<T> {
    /// Wait for the abandoned step to finish and report what it did.
    pub async fn settle(self) -> Result<T, TmsError> {
        let step = self.step;
        match self.task.await {
            Ok(result) => result.map_err(|e| e.in_step(step)),
            Err(e) => Err(TmsError::Internal(format!("{step}: HSM task failed: {e}"))),
        }
    }
}

/// Runs token work on the blocking pool with a dedicated session per call.
#[derive(Clone)]
pub struct Hsm {
    sessions: Arc<dyn SessionManager>,
    timeout: Duration,
}

impl fmt::Debug for Hsm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hsm")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Hsm {
    pub fn new(sessions: Arc<dyn SessionManager>, timeout: Duration) -> Self {
        Self { sessions, timeout }
    }

    /// Open a session, run `op` with exclusive access to it, then close it.
    ///
    /// On timeout the request fails and the step's [`Abort`] is set. The
    /// blocking closure keeps ownership of the session: the in-flight token
    /// call finishes and the session is closed, never returned for reuse.
    pub async fn with_session<T, F>(&self, step: &'static str, op: F) -> Result<T, TmsError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn TokenSession, &Abort) -> Result<T, TmsError> + Send + 'static,
    {
        match self.run_step(step, op).await {
            StepOutcome::Completed(result) => result,
            StepOutcome::TimedOut(_) => Err(TmsError::Timeout { step }),
        }
    }

    /// Like [`Hsm::with_session`], but a timed-out step is handed back so the
    /// caller can find out whether its last token call took effect.
    pub async fn run_step<T, F>(&self, step: &'static str, op: F) -> StepOutcome<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn TokenSession, &Abort) -> Result<T, TmsError> + Send + 'static,
    {
        let abort = Abort::default();
        let _abort_on_drop = AbortOnDrop(abort.clone());

        let sessions = self.sessions.clone();
        let step_abort = abort.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            step_abort.check(step)?;
            let mut session = sessions.open()?;
            debug!(step, "HSM session opened");
            let result = op(session.as_token(), &step_abort);
            sessions.close(session);
            result
        });

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(result)) => StepOutcome::Completed(result.map_err(|e| e.in_step(step))),
            Ok(Err(e)) => StepOutcome::Completed(Err(TmsError::Internal(format!(
                "{step}: HSM task failed: {e}"
            )))),
            Err(_) => {
                abort.set();
                StepOutcome::TimedOut(LateStep { step, task })
            }
        }
    }
}
