//! Shamir's Secret Sharing over GF(256).
//!
//! Thin layer over `sharks` that fixes the wire format of a share
//! (`x || y…`, one byte longer than the secret) and the single-share case,
//! where the "share" is the secret itself.

use std::collections::HashSet;

use sharks::{Share, Sharks};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Bytes a share adds on top of the secret it protects (the x-coordinate).
pub const SHARE_OVERHEAD: usize = 1;

/// Maximum number of shares a secret can be split into.
pub const MAX_SHARES: usize = 255;

/// Split `secret` into `shares` parts, any `threshold` of which recombine it.
///
/// With a single share the secret is returned unchanged.
///
/// # Errors
///
/// Returns [`CryptoError::SecretSharing`] if the parameters are out of range.
pub fn split(secret: &[u8], shares: usize, threshold: usize) -> Result<Vec<Vec<u8>>, CryptoError> {
    if secret.is_empty() {
        return Err(sharing_error("cannot split an empty secret"));
    }
    if shares == 0 || shares > MAX_SHARES {
        return Err(sharing_error(format!(
            "share count must be 1-{MAX_SHARES}, got {shares}"
        )));
    }
    if shares == 1 {
        if threshold != 1 {
            return Err(sharing_error("a single share requires a threshold of 1"));
        }
        return Ok(vec![secret.to_vec()]);
    }
    if threshold < 2 || threshold > shares {
        return Err(sharing_error(format!(
            "threshold must be 2-{shares}, got {threshold}"
        )));
    }

    let threshold = u8::try_from(threshold).map_err(|_| sharing_error("threshold too large"))?;
    let dealer = Sharks(threshold).dealer(secret);
    Ok(dealer.take(shares).map(|s| Vec::from(&s)).collect())
}

/// Recombine at least `threshold` distinct shares into the original secret.
///
/// # Errors
///
/// Returns [`CryptoError::SecretSharing`] when too few parts are given, the
/// parts differ in length, or two parts share an x-coordinate.
pub fn combine<P: AsRef<[u8]>>(
    parts: &[P],
    threshold: usize,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if parts.len() < 2 || parts.len() < threshold {
        return Err(sharing_error(format!(
            "need at least {} parts, got {}",
            threshold.max(2),
            parts.len()
        )));
    }

    let len = parts[0].as_ref().len();
    if len <= SHARE_OVERHEAD {
        return Err(sharing_error("parts are too short"));
    }
    let mut xs = HashSet::with_capacity(parts.len());
    let mut shares = Vec::with_capacity(parts.len());
    for part in parts {
        let part = part.as_ref();
        if part.len() != len {
            return Err(sharing_error("all parts must be the same length"));
        }
        if !xs.insert(part[0]) {
            return Err(sharing_error("duplicate part detected"));
        }
        let share = Share::try_from(part).map_err(|e| sharing_error(e.to_string()))?;
        shares.push(share);
    }

    let threshold = u8::try_from(threshold).map_err(|_| sharing_error("threshold too large"))?;
    Sharks(threshold)
        .recover(&shares)
        .map(Zeroizing::new)
        .map_err(|e| sharing_error(e.to_string()))
}

fn sharing_error(reason: impl Into<String>) -> CryptoError {
    CryptoError::SecretSharing {
        reason: reason.into(),
    }
}
