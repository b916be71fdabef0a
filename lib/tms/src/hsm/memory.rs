//! In-process software token
//!
//! Mimics the object model of a PKCS#11 token (labeled public/private
//! objects, slot label, user PIN) without hardware. Key pairs share a random
//! secret and "signatures" are HMAC-SHA256 tags under that secret, which is
//! enough to exercise sign/verify/tamper behaviour in tests and local
//! development. It is not RSA and must not be used to protect real documents.
//!
//! Login state is token-wide as on a PKCS#11 token: the first session logs
//! the user in, later sessions join that login, and closing the last session
//! logs out. Each session tracks its active sign/verify operation, so a
//! session driven by two operations at once is reported, not masked.
//!
//! Faults can be injected to exercise error paths: failing session opens,
//! failing sign/verify calls, slow object lookups and slow key generation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use super::{
    HsmError, HsmSession, KeyAttribute, KeyClass, KeyGenMechanism, ObjectHandle, SessionManager,
    SignMechanism, TokenSession, template_class, template_label,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
struct StoredObject {
    class: KeyClass,
    label: String,
    secret: [u8; 32],
}

#[derive(Debug, Default)]
struct TokenState {
    objects: HashMap<u64, StoredObject>,
    next_handle: u64,
    logged_in: bool,
    open_sessions: usize,
    peak_open_sessions: usize,
    sessions_opened: usize,
    // sessions with a sign/verify operation in progress
    active_operations: HashSet<u64>,
    operation_conflicts: usize,
    crypto_calls: usize,
    lookup_delay: Duration,
    keygen_delay: Duration,
    fail_open: bool,
    fail_crypto: bool,
}

/// A software token with a label and user PIN. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryToken {
    label: String,
    pin: String,
    state: Arc<Mutex<TokenState>>,
}

impl MemoryToken {
    pub fn new(label: &str, pin: &str) -> Self {
        Self {
            label: label.to_string(),
            pin: pin.to_string(),
            state: Arc::new(Mutex::new(TokenState {
                next_handle: 1,
                ..TokenState::default()
            })),
        }
    }

    /// A session manager configured with the given token label and PIN.
    pub fn session_manager(&self, token_label: &str, pin: &str) -> MemorySessionManager {
        MemorySessionManager {
            slots: vec![self.clone()],
            token_label: token_label.to_string(),
            pin: pin.to_string(),
        }
    }

    /// Sessions currently open against this token.
    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    /// Most sessions that were open at the same time.
    pub fn peak_open_sessions(&self) -> usize {
        self.lock().peak_open_sessions
    }

    /// Whether the user is logged in to the token.
    pub fn is_logged_in(&self) -> bool {
        self.lock().logged_in
    }

    /// Sign/verify calls refused because their session already had an
    /// operation in progress.
    pub fn operation_conflicts(&self) -> usize {
        self.lock().operation_conflicts
    }

    /// Sessions opened over the token's lifetime.
    pub fn sessions_opened(&self) -> usize {
        self.lock().sessions_opened
    }

    /// Sign and verify calls that reached the token.
    pub fn crypto_calls(&self) -> usize {
        self.lock().crypto_calls
    }

    /// Number of key objects (public and private) on the token.
    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// Make every sign/verify call fail, as a faulty device would.
    pub fn set_fail_crypto(&self, fail: bool) {
        self.lock().fail_crypto = fail;
    }

    /// Block every object search for `delay`, as a busy device would.
    pub fn set_lookup_delay(&self, delay: Duration) {
        self.lock().lookup_delay = delay;
    }

    /// Block every key pair generation for `delay` before the objects appear.
    pub fn set_keygen_delay(&self, delay: Duration) {
        self.lock().keygen_delay = delay;
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        // A panic while holding the lock cannot leave the map half-written,
        // so recover the guard instead of propagating poison.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Session manager over a list of software tokens ("slots").
#[derive(Debug, Clone)]
pub struct MemorySessionManager {
    slots: Vec<MemoryToken>,
    token_label: String,
    pin: String,
}

impl MemorySessionManager {
    pub fn with_slots(slots: Vec<MemoryToken>, token_label: &str, pin: &str) -> Self {
        Self {
            slots,
            token_label: token_label.to_string(),
            pin: pin.to_string(),
        }
    }
}

impl SessionManager for MemorySessionManager {
    fn open(&self) -> Result<HsmSession, HsmError> {
        let token = self
            .slots
            .iter()
            .find(|t| t.label == self.token_label)
            .ok_or_else(|| HsmError::TokenNotFound(self.token_label.clone()))?;

        let mut state = token.lock();
        if state.fail_open {
            return Err(HsmError::SessionOpenFailed(
                "CKR_SESSION_COUNT (injected)".into(),
            ));
        }
        if token.pin != self.pin {
            return Err(HsmError::LoginFailed("CKR_PIN_INCORRECT".into()));
        }
        // Joins the existing login if another session is open.
        state.logged_in = true;
        state.sessions_opened += 1;
        state.open_sessions += 1;
        state.peak_open_sessions = state.peak_open_sessions.max(state.open_sessions);
        let id = state.sessions_opened as u64;
        drop(state);

        Ok(HsmSession::new(Box::new(MemorySession {
            token: token.clone(),
            id,
        })))
    }
}

struct MemorySession {
    token: MemoryToken,
    id: u64,
}

impl MemorySession {
    /// Start a sign/verify operation on `handle`, which must be a key of `class`.
    fn begin_operation(
        &self,
        handle: ObjectHandle,
        class: KeyClass,
        init_error: fn(String) -> HsmError,
    ) -> Result<StoredObject, HsmError> {
        let mut state = self.token.lock();
        if !state.logged_in {
            return Err(init_error("CKR_USER_NOT_LOGGED_IN".into()));
        }
        state.crypto_calls += 1;
        if state.fail_crypto {
            return Err(init_error("CKR_DEVICE_ERROR (injected)".into()));
        }
        let object = match state.objects.get(&handle.id()) {
            Some(object) if object.class == class => object.clone(),
            Some(_) => return Err(init_error("CKR_KEY_TYPE_INCONSISTENT".into())),
            None => return Err(init_error("CKR_KEY_HANDLE_INVALID".into())),
        };
        if !state.active_operations.insert(self.id) {
            state.operation_conflicts += 1;
            return Err(HsmError::OperationActive("CKR_OPERATION_ACTIVE".into()));
        }
        Ok(object)
    }

    fn end_operation(&self) {
        self.token.lock().active_operations.remove(&self.id);
    }
}

fn mac(secret: &[u8; 32], data: &[u8]) -> Result<HmacSha256, HsmError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| HsmError::SignFailed(format!("Invalid key length: {}", e)))?;
    mac.update(data);
    Ok(mac)
}

impl TokenSession for MemorySession {
    fn generate_key_pair(
        &mut self,
        _mechanism: KeyGenMechanism,
        public_template: &[KeyAttribute],
        private_template: &[KeyAttribute],
    ) -> Result<(ObjectHandle, ObjectHandle), HsmError> {
        let label_of = |template: &[KeyAttribute]| -> Result<String, HsmError> {
            let bytes = template_label(template)
                .ok_or_else(|| HsmError::KeyGenerationFailed("CKR_TEMPLATE_INCOMPLETE".into()))?;
            String::from_utf8(bytes.to_vec())
                .map_err(|_| HsmError::KeyGenerationFailed("CKR_ATTRIBUTE_VALUE_INVALID".into()))
        };
        let public_label = label_of(public_template)?;
        let private_label = label_of(private_template)?;

        if template_class(public_template) != Some(KeyClass::Public)
            || template_class(private_template) != Some(KeyClass::Private)
        {
            return Err(HsmError::KeyGenerationFailed(
                "CKR_TEMPLATE_INCONSISTENT".into(),
            ));
        }

        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);

        let delay = self.token.lock().keygen_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.token.lock();
        let public_handle = state.next_handle;
        let private_handle = state.next_handle + 1;
        state.next_handle += 2;
        state.objects.insert(
            public_handle,
            StoredObject {
                class: KeyClass::Public,
                label: public_label,
                secret,
            },
        );
        state.objects.insert(
            private_handle,
            StoredObject {
                class: KeyClass::Private,
                label: private_label,
                secret,
            },
        );

        Ok((
            ObjectHandle::new(public_handle),
            ObjectHandle::new(private_handle),
        ))
    }

    fn find_objects(&mut self, template: &[KeyAttribute]) -> Result<Vec<ObjectHandle>, HsmError> {
        let label = template_label(template);
        let class = template_class(template);
        let state = self.token.lock();

        let mut handles: Vec<u64> = state
            .objects
            .iter()
            .filter(|(_, object)| label.is_none_or(|l| object.label.as_bytes() == l))
            .filter(|(_, object)| class.is_none_or(|c| object.class == c))
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort_unstable();
        let delay = state.lookup_delay;
        drop(state);

        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        Ok(handles.into_iter().map(ObjectHandle::new).collect())
    }

    fn object_label(&mut self, handle: ObjectHandle) -> Result<Option<String>, HsmError> {
        let state = self.token.lock();
        state
            .objects
            .get(&handle.id())
            .map(|object| Some(object.label.clone()))
            .ok_or_else(|| HsmError::LookupFailed("CKR_OBJECT_HANDLE_INVALID".into()))
    }

    fn destroy_object(&mut self, handle: ObjectHandle) -> Result<(), HsmError> {
        let mut state = self.token.lock();
        state
            .objects
            .remove(&handle.id())
            .map(|_| ())
            .ok_or_else(|| HsmError::DestroyFailed("CKR_OBJECT_HANDLE_INVALID".into()))
    }

    fn sign(
        &mut self,
        _mechanism: SignMechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, HsmError> {
        let object = self.begin_operation(key, KeyClass::Private, HsmError::SignInitFailed)?;
        let signature = mac(&object.secret, data).map(|m| m.finalize().into_bytes().to_vec());
        self.end_operation();
        signature
    }

    fn verify(
        &mut self,
        _mechanism: SignMechanism,
        key: ObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, HsmError> {
        let object = self.begin_operation(key, KeyClass::Public, HsmError::VerifyInitFailed)?;
        let valid = mac(&object.secret, data).map(|m| m.verify_slice(signature).is_ok());
        self.end_operation();
        valid
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let mut state = self.token.lock();
        state.active_operations.remove(&self.id);
        state.open_sessions = state.open_sessions.saturating_sub(1);
        if state.open_sessions == 0 {
            state.logged_in = false;
        }
    }
}
