// SPDX-License-Identifier: Apache-2.0

//! Binary package manifest: a fixed header describing the package, then an
//! ordered component list with digests and sizes. Everything little-endian,
//! strings length-prefixed UTF-8.

use crate::constants::MANIFEST_MAGIC;
use crate::error::{Result, UpdateError};
use serde::Serialize;

fn bad(msg: impl Into<String>) -> UpdateError {
    UpdateError::BadPackage(msg.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DigestAlg {
    Sha256,
    Sha384,
}

impl DigestAlg {
    pub fn digest_len(self) -> usize {
        match self {
            DigestAlg::Sha256 => 32,
            DigestAlg::Sha384 => 48,
        }
    }

    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(DigestAlg::Sha256),
            1 => Ok(DigestAlg::Sha384),
            other => Err(UpdateError::UnknownAlgorithm(other)),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            DigestAlg::Sha256 => 0,
            DigestAlg::Sha384 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignatureAlg {
    Rsa,
    EcdsaP256,
}

impl SignatureAlg {
    pub fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(SignatureAlg::Rsa),
            1 => Ok(SignatureAlg::EcdsaP256),
            other => Err(UpdateError::UnknownAlgorithm(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            SignatureAlg::Rsa => 0,
            SignatureAlg::EcdsaP256 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PackageFormat {
    Upgrade,
    Zip,
    Lz4,
    Gzip,
}

impl PackageFormat {
    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(PackageFormat::Upgrade),
            1 => Ok(PackageFormat::Zip),
            2 => Ok(PackageFormat::Lz4),
            3 => Ok(PackageFormat::Gzip),
            other => Err(bad(format!("unknown package format {}", other))),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PackageFormat::Upgrade => 0,
            PackageFormat::Zip => 1,
            PackageFormat::Lz4 => 2,
            PackageFormat::Gzip => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ComponentType {
    RawImage,
    PatchBlob,
    TransferList,
    UpdaterProgram,
    Script,
    Resource,
}

impl ComponentType {
    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(ComponentType::RawImage),
            1 => Ok(ComponentType::PatchBlob),
            2 => Ok(ComponentType::TransferList),
            3 => Ok(ComponentType::UpdaterProgram),
            4 => Ok(ComponentType::Script),
            5 => Ok(ComponentType::Resource),
            other => Err(bad(format!("unknown component type {}", other))),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ComponentType::RawImage => 0,
            ComponentType::PatchBlob => 1,
            ComponentType::TransferList => 2,
            ComponentType::UpdaterProgram => 3,
            ComponentType::Script => 4,
            ComponentType::Resource => 5,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentEntry {
    pub identity: String,
    pub component_type: ComponentType,
    pub packed_size: u64,
    pub unpacked_size: u64,
    #[serde(serialize_with = "hex_digest")]
    pub digest: Vec<u8>,
    pub version: String,
    pub flags: u8,
    pub resource_type: u8,
}

fn hex_digest<S: serde::Serializer>(digest: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(digest))
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageManifest {
    pub software_version: String,
    pub product_id: String,
    pub created_at: u64,
    pub file_version: u32,
    pub digest_alg: DigestAlg,
    pub signature_alg: SignatureAlg,
    pub package_format: PackageFormat,
    pub entries: Vec<ComponentEntry>,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(bad("manifest truncated"));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let len = u16::from_le_bytes(self.take(2)?.try_into().unwrap()) as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| bad("manifest string not utf-8"))
    }
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

impl PackageManifest {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader { data, pos: 0 };
        if r.take(4)? != MANIFEST_MAGIC {
            return Err(bad("bad manifest magic"));
        }
        let software_version = r.string()?;
        let product_id = r.string()?;
        let created_at = r.u64()?;
        let file_version = r.u32()?;
        let digest_alg = DigestAlg::from_u8(r.u8()?)?;
        let signature_alg = SignatureAlg::from_u8(r.u8()?)?;
        let package_format = PackageFormat::from_u8(r.u8()?)?;
        let entry_count = r.u32()? as usize;

        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let identity = r.string()?;
            let component_type = ComponentType::from_u8(r.u8()?)?;
            let packed_size = r.u64()?;
            let unpacked_size = r.u64()?;
            let digest = r.take(digest_alg.digest_len())?.to_vec();
            let version = r.string()?;
            let flags = r.u8()?;
            let resource_type = r.u8()?;
            entries.push(ComponentEntry {
                identity,
                component_type,
                packed_size,
                unpacked_size,
                digest,
                version,
                flags,
                resource_type,
            });
        }
        if r.pos != data.len() {
            return Err(bad("trailing bytes after manifest entries"));
        }

        Ok(Self {
            software_version,
            product_id,
            created_at,
            file_version,
            digest_alg,
            signature_alg,
            package_format,
            entries,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(MANIFEST_MAGIC);
        put_string(&mut out, &self.software_version);
        put_string(&mut out, &self.product_id);
        out.extend_from_slice(&self.created_at.to_le_bytes());
        out.extend_from_slice(&self.file_version.to_le_bytes());
        out.push(self.digest_alg.as_u8());
        out.push(self.signature_alg.as_u8());
        out.push(self.package_format.as_u8());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            if entry.digest.len() != self.digest_alg.digest_len() {
                return Err(bad(format!(
                    "entry {} digest length {} does not match algorithm",
                    entry.identity,
                    entry.digest.len()
                )));
            }
            put_string(&mut out, &entry.identity);
            out.push(entry.component_type.as_u8());
            out.extend_from_slice(&entry.packed_size.to_le_bytes());
            out.extend_from_slice(&entry.unpacked_size.to_le_bytes());
            out.extend_from_slice(&entry.digest);
            put_string(&mut out, &entry.version);
            out.push(entry.flags);
            out.push(entry.resource_type);
        }
        Ok(out)
    }

    pub fn find(&self, identity: &str) -> Option<&ComponentEntry> {
        self.entries.iter().find(|e| e.identity == identity)
    }

    pub fn components_of(&self, component_type: ComponentType) -> impl Iterator<Item = &ComponentEntry> {
        self.entries
            .iter()
            .filter(move |e| e.component_type == component_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PackageManifest {
        PackageManifest {
            software_version: "3.1.0".into(),
            product_id: "device-x1".into(),
            created_at: 1_750_000_000,
            file_version: 1,
            digest_alg: DigestAlg::Sha256,
            signature_alg: SignatureAlg::Rsa,
            package_format: PackageFormat::Upgrade,
            entries: vec![
                ComponentEntry {
                    identity: "system.img".into(),
                    component_type: ComponentType::RawImage,
                    packed_size: 1024,
                    unpacked_size: 4096,
                    digest: vec![7u8; 32],
                    version: "3.1.0".into(),
                    flags: 0,
                    resource_type: 0,
                },
                ComponentEntry {
                    identity: "updater_binary".into(),
                    component_type: ComponentType::UpdaterProgram,
                    packed_size: 512,
                    unpacked_size: 512,
                    digest: vec![9u8; 32],
                    version: "3.1.0".into(),
                    flags: 1,
                    resource_type: 0,
                },
            ],
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let manifest = sample();
        let encoded = manifest.encode().unwrap();
        let decoded = PackageManifest::decode(&encoded).unwrap();
        assert_eq!(decoded.software_version, "3.1.0");
        assert_eq!(decoded.product_id, "device-x1");
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.entries[1].identity, "updater_binary");
        assert_eq!(decoded.entries[1].component_type, ComponentType::UpdaterProgram);
        assert_eq!(decoded.entries[0].digest, vec![7u8; 32]);
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let encoded = sample().encode().unwrap();
        assert!(PackageManifest::decode(&encoded[..encoded.len() - 3]).is_err());
        let mut corrupt = encoded.clone();
        corrupt[0] = b'X';
        assert!(PackageManifest::decode(&corrupt).is_err());
    }

    #[test]
    fn digest_length_follows_algorithm() {
        let mut manifest = sample();
        manifest.digest_alg = DigestAlg::Sha384;
        // sha384 digests are 48 bytes; 32-byte digests no longer encode
        assert!(manifest.encode().is_err());
        for entry in &mut manifest.entries {
            entry.digest = vec![1u8; 48];
        }
        let decoded = PackageManifest::decode(&manifest.encode().unwrap()).unwrap();
        assert_eq!(decoded.entries[0].digest.len(), 48);
    }

    #[test]
    fn find_and_filter() {
        let manifest = sample();
        assert!(manifest.find("system.img").is_some());
        assert!(manifest.find("nope").is_none());
        assert_eq!(
            manifest.components_of(ComponentType::UpdaterProgram).count(),
            1
        );
    }
}
