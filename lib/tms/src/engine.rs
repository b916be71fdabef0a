//! Signing and verification primitives
//!
//! One fixed suite: SHA-256 with RSA PKCS#1 v1.5, performed by the token as a
//! single-part operation. Payloads are passed whole; there is no streaming.

use crate::hsm::{HsmError, KeyClass, ObjectHandle, SignMechanism, TokenSession};
use crate::keys::find_key_by_label;

pub const SIGNATURE_MECHANISM: SignMechanism = SignMechanism::Sha256RsaPkcs;

/// Sign `payload` with the private key behind `private_key`.
pub fn sign(
    session: &mut dyn TokenSession,
    private_key: ObjectHandle,
    payload: &[u8],
) -> Result<Vec<u8>, HsmError> {
    session.sign(SIGNATURE_MECHANISM, private_key, payload)
}

/// Verify `signature` over `payload` with the public key behind `public_key`.
///
/// A signature the token rejects is `Ok(false)`; `Err` means the check could
/// not be performed at all.
pub fn verify(
    session: &mut dyn TokenSession,
    public_key: ObjectHandle,
    payload: &[u8],
    signature: &[u8],
) -> Result<bool, HsmError> {
    session.verify(SIGNATURE_MECHANISM, public_key, payload, signature)
}

/// Look up the private key for `label` and sign with it.
pub fn sign_with_label(
    session: &mut dyn TokenSession,
    label: &str,
    payload: &[u8],
) -> Result<Vec<u8>, HsmError> {
    let key = find_key_by_label(session, label, KeyClass::Private)?;
    sign(session, key, payload)
}

/// Look up the public key for `label` and verify with it.
pub fn verify_with_label(
    session: &mut dyn TokenSession,
    label: &str,
    payload: &[u8],
    signature: &[u8],
) -> Result<bool, HsmError> {
    let key = find_key_by_label(session, label, KeyClass::Public)?;
    verify(session, key, payload, signature)
}
