//! Identifier and secret generation.
//!
//! Every identifier with a random component draws from the operating
//! system CSPRNG through the fallible API. A CSPRNG failure is propagated
//! as [`Error::Internal`]; there is no deterministic fallback.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Entropy carried by every bearer secret, before encoding.
pub const SECRET_ENTROPY_BYTES: usize = 32;

/// Length of an encoded bearer secret. All secrets of a given kind share
/// this length so that length never distinguishes records.
pub const SECRET_ENCODED_LEN: usize = 44;

/// Normalize a plugin's self-declared stable name into the identifier
/// alphabet: lowercase ASCII alphanumerics and dashes, with runs of other
/// characters collapsed to a single dash.
pub fn normalize_self_id(self_id: &str) -> String {
    let mut out = String::with_capacity(self_id.len());
    let mut last_dash = true;
    for c in self_id.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("plugin");
    }
    out
}

/// Lowercase hex string of `n_bytes` CSPRNG bytes.
pub fn random_hex(n_bytes: usize) -> Result<String> {
    let mut buf = vec![0u8; n_bytes];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| Error::Internal(format!("secure random generator unavailable: {e}")))?;
    let mut out = String::with_capacity(n_bytes * 2);
    for b in &buf {
        out.push_str(&format!("{b:02x}"));
    }
    Ok(out)
}

/// Mint a runtime identifier: `normalize(self_id)-<8 hex chars>`.
pub fn runtime_id(self_id: &str) -> Result<String> {
    Ok(format!("{}-{}", normalize_self_id(self_id), random_hex(4)?))
}

/// Mint a capability grant identifier.
pub fn grant_id() -> Result<String> {
    Ok(format!("cap-{}", random_hex(8)?))
}

/// Mint a bearer secret: 32 bytes of CSPRNG entropy, standard base64.
///
/// The encoded form is always [`SECRET_ENCODED_LEN`] characters.
pub fn random_secret() -> Result<Zeroizing<String>> {
    let mut buf = Zeroizing::new([0u8; SECRET_ENTROPY_BYTES]);
    OsRng
        .try_fill_bytes(buf.as_mut())
        .map_err(|e| Error::Internal(format!("secure random generator unavailable: {e}")))?;
    let encoded = Zeroizing::new(BASE64.encode(buf.as_ref()));
    debug_assert_eq!(encoded.len(), SECRET_ENCODED_LEN);
    Ok(encoded)
}
