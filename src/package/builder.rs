// SPDX-License-Identifier: Apache-2.0

//! Package assembly: components in, signed container out. The packaging
//! side lives next to the reader so the wire format has exactly one home;
//! the CLI `pack` command and the test fixtures both go through here.

use crate::constants::{
    HASHTREE_ENTRY, MANIFEST_ENTRY, METHOD_LZ4, METHOD_STORE, NEW_DATA_SUFFIX, PATCH_DATA_SUFFIX,
    TRANSFER_LIST_SUFFIX, UPDATER_BINARY_ENTRY,
};
use crate::error::{Result, UpdateError};
use crate::package::manifest::{
    ComponentEntry, ComponentType, DigestAlg, PackageFormat, PackageManifest, SignatureAlg,
};
use crate::package::reader::crc32;
use crate::package::signature::{HashTree, SignatureTrailer};
use crate::package::zip::ZipWriter;
use rsa::pkcs8::DecodePrivateKey;
use rsa::Pkcs1v15Sign;
use sha2::{Digest, Sha256};

struct Component {
    identity: String,
    component_type: ComponentType,
    data: Vec<u8>,
    method: u16,
    version: String,
}

pub struct PackageBuilder {
    software_version: String,
    product_id: String,
    components: Vec<Component>,
}

impl PackageBuilder {
    pub fn new(software_version: &str, product_id: &str) -> Self {
        Self {
            software_version: software_version.to_string(),
            product_id: product_id.to_string(),
            components: Vec::new(),
        }
    }

    pub fn component(
        mut self,
        identity: &str,
        component_type: ComponentType,
        data: Vec<u8>,
        method: u16,
    ) -> Self {
        let version = self.software_version.clone();
        self.components.push(Component {
            identity: identity.to_string(),
            component_type,
            data,
            method,
            version,
        });
        self
    }

    /// Full images ride lz4; they are the bulk of a package.
    pub fn raw_image(self, identity: &str, data: Vec<u8>) -> Self {
        self.component(identity, ComponentType::RawImage, data, METHOD_LZ4)
    }

    pub fn updater_program(self, data: Vec<u8>) -> Self {
        self.component(
            UPDATER_BINARY_ENTRY,
            ComponentType::UpdaterProgram,
            data,
            METHOD_STORE,
        )
    }

    /// The per-partition transfer triple: program, new-data blob, patch blob.
    pub fn partition_payload(
        self,
        partition: &str,
        transfer_list: &str,
        new_data: Vec<u8>,
        patch_data: Vec<u8>,
    ) -> Self {
        self.component(
            &format!("{}{}", partition, TRANSFER_LIST_SUFFIX),
            ComponentType::TransferList,
            transfer_list.as_bytes().to_vec(),
            METHOD_STORE,
        )
        .component(
            &format!("{}{}", partition, NEW_DATA_SUFFIX),
            ComponentType::PatchBlob,
            new_data,
            METHOD_LZ4,
        )
        .component(
            &format!("{}{}", partition, PATCH_DATA_SUFFIX),
            ComponentType::PatchBlob,
            patch_data,
            METHOD_STORE,
        )
    }

    fn stored_bytes(component: &Component) -> Result<Vec<u8>> {
        match component.method {
            METHOD_STORE => Ok(component.data.clone()),
            METHOD_LZ4 => Ok(lz4_flex::compress_prepend_size(&component.data)),
            other => Err(UpdateError::UnsupportedEntry(other)),
        }
    }

    /// Lays out the container without a signature trailer.
    pub fn build_unsigned(self) -> Result<Vec<u8>> {
        self.build_container(SignatureAlg::Rsa).map(|(zip, _)| zip)
    }

    /// Lays out the container and appends an RSA-PKCS1/sha-256 trailer.
    pub fn build_signed(self, signing_key_pem: &str, cert_pem: &str) -> Result<Vec<u8>> {
        let version = self.software_version.clone();
        let (mut package, _) = self.build_container(SignatureAlg::Rsa)?;

        let key = rsa::RsaPrivateKey::from_pkcs8_pem(signing_key_pem)
            .map_err(|e| UpdateError::CertParseError(e.to_string()))?;

        let digest = Sha256::digest(&package);
        let mut signed_attrs = (version.len() as u16).to_le_bytes().to_vec();
        signed_attrs.extend_from_slice(version.as_bytes());

        let mut message = digest.to_vec();
        message.extend_from_slice(&signed_attrs);
        let hashed = Sha256::digest(&message);
        let signature = key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &hashed)
            .map_err(|e| UpdateError::VerifyFailed(e.to_string()))?;

        let trailer = SignatureTrailer {
            algorithm: SignatureAlg::Rsa,
            signed_attrs,
            signature,
            cert_pem: cert_pem.to_string(),
            offset: package.len() as u64,
        };
        package.extend_from_slice(&trailer.encode());
        Ok(package)
    }

    fn build_container(self, signature_alg: SignatureAlg) -> Result<(Vec<u8>, PackageManifest)> {
        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut writer = ZipWriter::new();
        let mut entries = Vec::new();
        let mut tree = HashTree::new();

        let mut stored_components = Vec::new();
        for component in &self.components {
            let stored = Self::stored_bytes(component)?;
            let digest: [u8; 32] = Sha256::digest(&component.data).into();
            tree.insert(&component.identity, digest);
            entries.push(ComponentEntry {
                identity: component.identity.clone(),
                component_type: component.component_type,
                packed_size: stored.len() as u64,
                unpacked_size: component.data.len() as u64,
                digest: digest.to_vec(),
                version: component.version.clone(),
                flags: 0,
                resource_type: 0,
            });
            stored_components.push(stored);
        }

        let manifest = PackageManifest {
            software_version: self.software_version.clone(),
            product_id: self.product_id.clone(),
            created_at,
            file_version: 1,
            digest_alg: DigestAlg::Sha256,
            signature_alg,
            package_format: PackageFormat::Upgrade,
            entries,
        };

        let manifest_bytes = manifest.encode()?;
        writer.add_entry(
            MANIFEST_ENTRY,
            &manifest_bytes,
            METHOD_STORE,
            crc32(&manifest_bytes),
            manifest_bytes.len() as u64,
        );
        let tree_bytes = tree.encode();
        writer.add_entry(
            HASHTREE_ENTRY,
            &tree_bytes,
            METHOD_STORE,
            crc32(&tree_bytes),
            tree_bytes.len() as u64,
        );
        for (component, stored) in self.components.iter().zip(&stored_components) {
            writer.add_entry(
                &component.identity,
                stored,
                component.method,
                crc32(&component.data),
                component.data.len() as u64,
            );
        }

        Ok((writer.finish(), manifest))
    }
}
