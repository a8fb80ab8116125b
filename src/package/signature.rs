// SPDX-License-Identifier: Apache-2.0

//! Package signature trailer and per-entry hash-tree verification.
//!
//! The trailer sits after the zip end-of-central-directory record:
//! `magic | algorithm | signed_attr_len | signed_attrs | signature_len |
//! signature | cert_chain(PEM)`. The digest covers every package byte before
//! the trailer; the signature covers `digest || signed_attrs`, and the
//! signed attributes bind the package version string.

use crate::constants::SIGN_TRAILER_MAGIC;
use crate::error::{Result, UpdateError};
use crate::package::manifest::{DigestAlg, SignatureAlg};
use p256::ecdsa::signature::Verifier;
use rsa::pkcs8::DecodePublicKey;
use rsa::Pkcs1v15Sign;
use sha2::{Digest, Sha256, Sha384};
use tracing::debug;

fn take<'a>(package: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    if *pos + n > package.len() {
        return Err(UpdateError::VerifyFailed("signature trailer truncated".into()));
    }
    let out = &package[*pos..*pos + n];
    *pos += n;
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct SignatureTrailer {
    pub algorithm: SignatureAlg,
    pub signed_attrs: Vec<u8>,
    pub signature: Vec<u8>,
    pub cert_pem: String,
    /// Offset of the trailer magic within the package; the digest covers
    /// `[0, offset)`.
    pub offset: u64,
}

impl SignatureTrailer {
    /// Scans backwards for the trailer magic and parses the record. The
    /// trailer is the last structure in the file, so the scan starts from
    /// the final window that could hold the magic.
    pub fn parse(package: &[u8]) -> Result<Self> {
        let magic_pos = package
            .windows(SIGN_TRAILER_MAGIC.len())
            .rposition(|w| w == SIGN_TRAILER_MAGIC)
            .ok_or_else(|| UpdateError::VerifyFailed("no signature trailer".into()))?;

        let mut pos = magic_pos + SIGN_TRAILER_MAGIC.len();
        let algorithm = SignatureAlg::from_u8(take(package, &mut pos, 1)?[0])?;
        let attr_len = u32::from_le_bytes(take(package, &mut pos, 4)?.try_into().unwrap()) as usize;
        let signed_attrs = take(package, &mut pos, attr_len)?.to_vec();
        let sig_len = u32::from_le_bytes(take(package, &mut pos, 4)?.try_into().unwrap()) as usize;
        let signature = take(package, &mut pos, sig_len)?.to_vec();
        let cert_pem = String::from_utf8(package[pos..].to_vec())
            .map_err(|_| UpdateError::CertParseError("certificate chain not utf-8".into()))?;

        Ok(Self {
            algorithm,
            signed_attrs,
            signature,
            cert_pem,
            offset: magic_pos as u64,
        })
    }

    /// The version string bound by the signed attributes.
    pub fn bound_version(&self) -> Result<String> {
        if self.signed_attrs.len() < 2 {
            return Err(UpdateError::VerifyFailed("signed attributes truncated".into()));
        }
        let len = u16::from_le_bytes(self.signed_attrs[..2].try_into().unwrap()) as usize;
        if 2 + len > self.signed_attrs.len() {
            return Err(UpdateError::VerifyFailed("signed attributes truncated".into()));
        }
        String::from_utf8(self.signed_attrs[2..2 + len].to_vec())
            .map_err(|_| UpdateError::VerifyFailed("bound version not utf-8".into()))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(SIGN_TRAILER_MAGIC);
        out.push(self.algorithm.as_u8());
        out.extend_from_slice(&(self.signed_attrs.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.signed_attrs);
        out.extend_from_slice(&(self.signature.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(self.cert_pem.as_bytes());
        out
    }
}

pub struct SignatureVerifier<'a> {
    pub cert_pem: &'a str,
    pub expected_version: Option<&'a str>,
}

impl<'a> SignatureVerifier<'a> {
    /// Verifies (i) the caller-computed package digest matches the digest
    /// algorithm's length, (ii) the trailer signature opens under the
    /// provisioned public key, (iii) the signer-bound version equals the
    /// expected version when one was supplied.
    pub fn verify(
        &self,
        trailer: &SignatureTrailer,
        digest_alg: DigestAlg,
        package_digest: &[u8],
    ) -> Result<()> {
        if package_digest.len() != digest_alg.digest_len() {
            return Err(UpdateError::VerifyFailed(format!(
                "digest length {} does not match algorithm",
                package_digest.len()
            )));
        }

        let mut message = Vec::with_capacity(package_digest.len() + trailer.signed_attrs.len());
        message.extend_from_slice(package_digest);
        message.extend_from_slice(&trailer.signed_attrs);

        match (trailer.algorithm, digest_alg) {
            (SignatureAlg::Rsa, DigestAlg::Sha256) => {
                let key = rsa::RsaPublicKey::from_public_key_pem(self.cert_pem)
                    .map_err(|e| UpdateError::CertParseError(e.to_string()))?;
                let hashed = Sha256::digest(&message);
                key.verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, &trailer.signature)
                    .map_err(|e| UpdateError::VerifyFailed(e.to_string()))?;
            }
            (SignatureAlg::Rsa, DigestAlg::Sha384) => {
                let key = rsa::RsaPublicKey::from_public_key_pem(self.cert_pem)
                    .map_err(|e| UpdateError::CertParseError(e.to_string()))?;
                let hashed = Sha384::digest(&message);
                key.verify(Pkcs1v15Sign::new::<Sha384>(), &hashed, &trailer.signature)
                    .map_err(|e| UpdateError::VerifyFailed(e.to_string()))?;
            }
            (SignatureAlg::EcdsaP256, DigestAlg::Sha256) => {
                let key = p256::ecdsa::VerifyingKey::from_public_key_pem(self.cert_pem)
                    .map_err(|e| UpdateError::CertParseError(e.to_string()))?;
                let signature = p256::ecdsa::Signature::from_der(&trailer.signature)
                    .map_err(|e| UpdateError::VerifyFailed(e.to_string()))?;
                key.verify(&message, &signature)
                    .map_err(|e| UpdateError::VerifyFailed(e.to_string()))?;
            }
            (SignatureAlg::EcdsaP256, DigestAlg::Sha384) => {
                return Err(UpdateError::UnknownAlgorithm(digest_alg as u8));
            }
        }

        if let Some(expected) = self.expected_version {
            let bound = trailer.bound_version()?;
            if bound != expected {
                return Err(UpdateError::VerifyFailed(format!(
                    "signer bound version {:?}, expected {:?}",
                    bound, expected
                )));
            }
        }
        debug!("package signature verified");
        Ok(())
    }
}

/// Computes the package digest covering everything before the trailer.
pub fn package_digest(package: &[u8], trailer_offset: u64, alg: DigestAlg) -> Vec<u8> {
    let body = &package[..trailer_offset as usize];
    match alg {
        DigestAlg::Sha256 => Sha256::digest(body).to_vec(),
        DigestAlg::Sha384 => Sha384::digest(body).to_vec(),
    }
}

/// The per-entry hash-tree sidecar: repeated `identity | sha256` records.
#[derive(Debug, Clone, Default)]
pub struct HashTree {
    entries: Vec<(String, [u8; 32])>,
}

impl HashTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identity: &str, digest: [u8; 32]) {
        self.entries.push((identity.to_string(), digest));
    }

    pub fn expected(&self, identity: &str) -> Option<&[u8; 32]> {
        self.entries
            .iter()
            .find(|(name, _)| name == identity)
            .map(|(_, digest)| digest)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos < data.len() {
            if pos + 2 > data.len() {
                return Err(UpdateError::VerifyFailed("hash tree truncated".into()));
            }
            let len = u16::from_le_bytes(data[pos..pos + 2].try_into().unwrap()) as usize;
            pos += 2;
            if pos + len + 32 > data.len() {
                return Err(UpdateError::VerifyFailed("hash tree truncated".into()));
            }
            let identity = String::from_utf8(data[pos..pos + len].to_vec())
                .map_err(|_| UpdateError::VerifyFailed("hash tree identity not utf-8".into()))?;
            pos += len;
            let digest: [u8; 32] = data[pos..pos + 32].try_into().unwrap();
            pos += 32;
            entries.push((identity, digest));
        }
        Ok(Self { entries })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (identity, digest) in &self.entries {
            out.extend_from_slice(&(identity.len() as u16).to_le_bytes());
            out.extend_from_slice(identity.as_bytes());
            out.extend_from_slice(digest);
        }
        out
    }

    /// Compares an extracted entry's running digest against the sidecar.
    /// Entries the sidecar does not list pass; listed entries must match.
    pub fn check(&self, identity: &str, actual: &[u8; 32]) -> Result<()> {
        match self.expected(identity) {
            None => Ok(()),
            Some(expected) if expected == actual => Ok(()),
            Some(expected) => Err(UpdateError::HashMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            }),
        }
    }
}
