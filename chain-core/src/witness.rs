//! M-of-N multi-signature witnesses
//!
//! The verification script lists the threshold and the ordered committee
//! keys: `[m:1][n:1][key:32]*n`. The invocation script carries the
//! signatures: `[count:1][signature:64]*count`, ordered by key position.

use crate::{Address, CoreError, CoreResult, PublicKey, Signature, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use serde::{Deserialize, Serialize};

/// Witness proving authorization of a block or payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    /// Signatures (invocation script)
    pub invocation: Vec<u8>,
    /// Threshold and keys (verification script)
    pub verification: Vec<u8>,
}

/// Build the verification script for an `m`-of-`keys.len()` committee
pub fn multisig_verification_script(m: usize, keys: &[PublicKey]) -> CoreResult<Vec<u8>> {
    if m == 0 || m > keys.len() || keys.len() > u8::MAX as usize {
        return Err(CoreError::Witness(format!(
            "invalid threshold {} for {} keys",
            m,
            keys.len()
        )));
    }
    let mut script = Vec::with_capacity(2 + keys.len() * PUBLIC_KEY_SIZE);
    script.push(m as u8);
    script.push(keys.len() as u8);
    for key in keys {
        script.extend_from_slice(key.as_bytes());
    }
    Ok(script)
}

/// Address controlled jointly by the committee
pub fn multisig_address(m: usize, keys: &[PublicKey]) -> CoreResult<Address> {
    Ok(Address::from_script(&multisig_verification_script(m, keys)?))
}

impl Witness {
    /// Assemble a multi-signature witness; `signatures` must follow key order
    pub fn multisig(m: usize, keys: &[PublicKey], signatures: &[Signature]) -> CoreResult<Self> {
        if signatures.len() != m {
            return Err(CoreError::Witness(format!(
                "expected {} signatures, got {}",
                m,
                signatures.len()
            )));
        }
        let verification = multisig_verification_script(m, keys)?;
        let mut invocation = Vec::with_capacity(1 + m * SIGNATURE_SIZE);
        invocation.push(m as u8);
        for signature in signatures {
            invocation.extend_from_slice(signature.as_bytes());
        }
        Ok(Self {
            invocation,
            verification,
        })
    }

    /// Script hash this witness satisfies
    pub fn script_address(&self) -> Address {
        Address::from_script(&self.verification)
    }

    /// Check that the signatures satisfy the verification script for `message`
    ///
    /// Signatures are matched against keys in order, each key used at most once.
    pub fn verify_multisig(&self, message: &[u8]) -> CoreResult<bool> {
        let (m, keys) = parse_verification(&self.verification)?;
        let signatures = parse_invocation(&self.invocation)?;
        if signatures.len() != m {
            return Ok(false);
        }

        let mut key_iter = keys.iter();
        for signature in &signatures {
            let matched = key_iter.by_ref().any(|key| key.verify(message, signature));
            if !matched {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn parse_verification(script: &[u8]) -> CoreResult<(usize, Vec<PublicKey>)> {
    let [m, n, rest @ ..] = script else {
        return Err(CoreError::Witness("verification script too short".to_string()));
    };
    let (m, n) = (*m as usize, *n as usize);
    if m == 0 || m > n || rest.len() != n * PUBLIC_KEY_SIZE {
        return Err(CoreError::Witness("malformed verification script".to_string()));
    }
    let keys = rest
        .chunks_exact(PUBLIC_KEY_SIZE)
        .map(|chunk| {
            let mut bytes = [0u8; PUBLIC_KEY_SIZE];
            bytes.copy_from_slice(chunk);
            PublicKey::from_bytes(bytes)
        })
        .collect::<CoreResult<Vec<_>>>()?;
    Ok((m, keys))
}

fn parse_invocation(script: &[u8]) -> CoreResult<Vec<Signature>> {
    let [count, rest @ ..] = script else {
        return Err(CoreError::Witness("invocation script is empty".to_string()));
    };
    if rest.len() != *count as usize * SIGNATURE_SIZE {
        return Err(CoreError::Witness("malformed invocation script".to_string()));
    }
    rest.chunks_exact(SIGNATURE_SIZE)
        .map(Signature::from_slice)
        .collect()
}
