//! PKCS#11 token access via cryptoki
//!
//! Works with any PKCS#11 module (SoftHSM2 in development). The slot is
//! resolved once, by token label, when the manager connects; every
//! [`SessionManager::open`] call then opens a fresh R/W session and logs in.
//! Login is per token, so a session opened while another is logged in joins
//! that login (`CKR_USER_ALREADY_LOGGED_IN`). Sessions never log out
//! explicitly; the token logs out when its last session closes.

use cryptoki::context::{CInitializeArgs, Function, Pkcs11};
use cryptoki::error::{Error as CryptokiError, RvError};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, KeyType as CkKeyType, ObjectClass};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use tracing::{debug, info};

use super::{
    HsmError, HsmSession, KeyAttribute, KeyClass, KeyGenMechanism, KeyType, ObjectHandle,
    SessionManager, SignMechanism, TokenSession,
};
use crate::config::HsmConfig;

/// Session manager for a token reached through a PKCS#11 module.
pub struct Pkcs11SessionManager {
    pkcs11: Pkcs11,
    slot: Slot,
    pin: String,
}

impl std::fmt::Debug for Pkcs11SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkcs11SessionManager")
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl Pkcs11SessionManager {
    /// Load the module, initialize it and find the slot holding the configured token.
    pub fn connect(config: &HsmConfig) -> Result<Self, HsmError> {
        let pkcs11 = Pkcs11::new(&config.library_path)
            .map_err(|e| HsmError::Library(format!("{}: {}", config.library_path, e)))?;
        pkcs11
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| HsmError::Library(e.to_string()))?;

        let slot = find_slot(&pkcs11, &config.token_label)?;
        info!(token = %config.token_label, "PKCS#11 token resolved to {:?}", slot);

        Ok(Self {
            pkcs11,
            slot,
            pin: config.pin.clone(),
        })
    }
}

fn find_slot(pkcs11: &Pkcs11, token_label: &str) -> Result<Slot, HsmError> {
    let slots = pkcs11
        .get_slots_with_token()
        .map_err(|e| HsmError::Library(format!("Slot enumeration failed: {}", e)))?;

    slots
        .into_iter()
        .find(|slot| {
            pkcs11
                .get_token_info(*slot)
                .map(|info| info.label() == token_label)
                .unwrap_or(false)
        })
        .ok_or_else(|| HsmError::TokenNotFound(token_label.to_string()))
}

impl SessionManager for Pkcs11SessionManager {
    fn open(&self) -> Result<HsmSession, HsmError> {
        let session = self
            .pkcs11
            .open_rw_session(self.slot)
            .map_err(|e| HsmError::SessionOpenFailed(e.to_string()))?;

        // On login failure `session` is dropped here, which closes it.
        match session.login(UserType::User, Some(&AuthPin::new(self.pin.as_str().into()))) {
            Ok(()) => {}
            Err(e) if is_already_logged_in(&e) => {}
            Err(e) => return Err(HsmError::LoginFailed(e.to_string())),
        }

        debug!("PKCS#11 session opened on {:?}", self.slot);
        Ok(HsmSession::new(Box::new(Pkcs11Session {
            session,
            handles: Vec::new(),
        })))
    }
}

/// A logged-in cryptoki session. Object handles returned to callers are
/// indices into `handles`, so they are only meaningful within this session.
struct Pkcs11Session {
    session: Session,
    handles: Vec<cryptoki::object::ObjectHandle>,
}

impl Pkcs11Session {
    fn register(&mut self, handle: cryptoki::object::ObjectHandle) -> ObjectHandle {
        let index = match self.handles.iter().position(|h| *h == handle) {
            Some(index) => index,
            None => {
                self.handles.push(handle);
                self.handles.len() - 1
            }
        };
        ObjectHandle::new(index as u64)
    }

    fn resolve(
        &self,
        handle: ObjectHandle,
        error: fn(String) -> HsmError,
    ) -> Result<cryptoki::object::ObjectHandle, HsmError> {
        self.handles
            .get(handle.id() as usize)
            .copied()
            .ok_or_else(|| error(format!("Unknown object handle {}", handle.id())))
    }
}

pub(crate) fn to_attribute(attribute: &KeyAttribute) -> Attribute {
    match attribute {
        KeyAttribute::Class(KeyClass::Public) => Attribute::Class(ObjectClass::PUBLIC_KEY),
        KeyAttribute::Class(KeyClass::Private) => Attribute::Class(ObjectClass::PRIVATE_KEY),
        KeyAttribute::KeyType(KeyType::Rsa) => Attribute::KeyType(CkKeyType::RSA),
        KeyAttribute::Token(v) => Attribute::Token(*v),
        KeyAttribute::Private(v) => Attribute::Private(*v),
        KeyAttribute::Sensitive(v) => Attribute::Sensitive(*v),
        KeyAttribute::Encrypt(v) => Attribute::Encrypt(*v),
        KeyAttribute::Decrypt(v) => Attribute::Decrypt(*v),
        KeyAttribute::Sign(v) => Attribute::Sign(*v),
        KeyAttribute::Verify(v) => Attribute::Verify(*v),
        KeyAttribute::ModulusBits(bits) => Attribute::ModulusBits((*bits).into()),
        KeyAttribute::PublicExponent(e) => Attribute::PublicExponent(e.clone()),
        KeyAttribute::Label(l) => Attribute::Label(l.clone()),
    }
}

fn to_attributes(template: &[KeyAttribute]) -> Vec<Attribute> {
    template.iter().map(to_attribute).collect()
}

fn sign_mechanism(mechanism: SignMechanism) -> Mechanism<'static> {
    match mechanism {
        SignMechanism::Sha256RsaPkcs => Mechanism::Sha256RsaPkcs,
    }
}

fn is_already_logged_in(e: &CryptokiError) -> bool {
    matches!(e, CryptokiError::Pkcs11(RvError::UserAlreadyLoggedIn, _))
}

fn is_invalid_signature(e: &CryptokiError) -> bool {
    matches!(
        e,
        CryptokiError::Pkcs11(RvError::SignatureInvalid | RvError::SignatureLenRange, _)
    )
}

fn failed_in_sign_init(e: &CryptokiError) -> bool {
    matches!(e, CryptokiError::Pkcs11(_, Function::SignInit))
}

fn failed_in_verify_init(e: &CryptokiError) -> bool {
    matches!(e, CryptokiError::Pkcs11(_, Function::VerifyInit))
}

impl TokenSession for Pkcs11Session {
    fn generate_key_pair(
        &mut self,
        mechanism: KeyGenMechanism,
        public_template: &[KeyAttribute],
        private_template: &[KeyAttribute],
    ) -> Result<(ObjectHandle, ObjectHandle), HsmError> {
        let mechanism = match mechanism {
            KeyGenMechanism::RsaPkcsKeyPairGen => Mechanism::RsaPkcsKeyPairGen,
        };
        let (public, private) = self
            .session
            .generate_key_pair(
                &mechanism,
                &to_attributes(public_template),
                &to_attributes(private_template),
            )
            .map_err(|e| HsmError::KeyGenerationFailed(e.to_string()))?;

        Ok((self.register(public), self.register(private)))
    }

    fn find_objects(&mut self, template: &[KeyAttribute]) -> Result<Vec<ObjectHandle>, HsmError> {
        let found = self
            .session
            .find_objects(&to_attributes(template))
            .map_err(|e| HsmError::LookupFailed(e.to_string()))?;

        Ok(found.into_iter().map(|h| self.register(h)).collect())
    }

    fn object_label(&mut self, handle: ObjectHandle) -> Result<Option<String>, HsmError> {
        let handle = self.resolve(handle, HsmError::LookupFailed)?;
        let attrs = self
            .session
            .get_attributes(handle, &[AttributeType::Label])
            .map_err(|e| HsmError::LookupFailed(e.to_string()))?;

        Ok(attrs.into_iter().find_map(|attr| match attr {
            Attribute::Label(bytes) => String::from_utf8(bytes).ok(),
            _ => None,
        }))
    }

    fn destroy_object(&mut self, handle: ObjectHandle) -> Result<(), HsmError> {
        let handle = self.resolve(handle, HsmError::DestroyFailed)?;
        self.session
            .destroy_object(handle)
            .map_err(|e| HsmError::DestroyFailed(e.to_string()))
    }

    fn sign(
        &mut self,
        mechanism: SignMechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, HsmError> {
        let key = self.resolve(key, HsmError::SignInitFailed)?;
        self.session
            .sign(&sign_mechanism(mechanism), key, data)
            .map_err(|e| {
                if failed_in_sign_init(&e) {
                    HsmError::SignInitFailed(e.to_string())
                } else {
                    HsmError::SignFailed(e.to_string())
                }
            })
    }

    fn verify(
        &mut self,
        mechanism: SignMechanism,
        key: ObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, HsmError> {
        let key = self.resolve(key, HsmError::VerifyInitFailed)?;
        match self
            .session
            .verify(&sign_mechanism(mechanism), key, data, signature)
        {
            Ok(()) => Ok(true),
            Err(e) if is_invalid_signature(&e) => Ok(false),
            Err(e) if failed_in_verify_init(&e) => {
                Err(HsmError::VerifyInitFailed(e.to_string()))
            }
            Err(e) => Err(HsmError::VerifyFailed(e.to_string())),
        }
    }
}
