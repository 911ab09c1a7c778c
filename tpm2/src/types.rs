// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 data types

use anyhow::{bail, Result};

use super::buf::{Marshal, ReadBuf, Unmarshal, WriteBuf};
use super::constants::*;

/// TPM2B_DIGEST - Variable length digest
#[derive(Debug, Clone, Default)]
pub struct Tpm2bDigest {
    pub buffer: Vec<u8>,
}

impl Tpm2bDigest {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }

    pub fn empty() -> Self {
        Self { buffer: Vec::new() }
    }
}

impl Marshal for Tpm2bDigest {
    fn marshal(&self, buf: &mut WriteBuf) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bDigest {
    fn unmarshal(buf: &mut ReadBuf) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// TPM2B_AUTH - Authorization value
#[derive(Debug, Clone, Default)]
pub struct Tpm2bAuth {
    pub buffer: Vec<u8>,
}

impl Tpm2bAuth {
    pub fn empty() -> Self {
        Self { buffer: Vec::new() }
    }
}

impl Marshal for Tpm2bAuth {
    fn marshal(&self, buf: &mut WriteBuf) {
        buf.put_tpm2b(&self.buffer);
    }
}

/// TPM2B_SENSITIVE_DATA - Caller-supplied secret material
#[derive(Debug, Clone, Default)]
pub struct Tpm2bSensitiveData {
    pub buffer: Vec<u8>,
}

impl Tpm2bSensitiveData {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }
}

impl Marshal for Tpm2bSensitiveData {
    fn marshal(&self, buf: &mut WriteBuf) {
        buf.put_tpm2b(&self.buffer);
    }
}

/// TPMS_PCR_SELECTION - PCR selection for a single hash algorithm
#[derive(Debug, Clone)]
pub struct TpmsPcrSelection {
    pub hash: TpmAlgId,
    pub pcr_select: Vec<u8>, // Bitmap of selected PCRs
}

impl TpmsPcrSelection {
    pub fn new(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        // Calculate required size (at least 3 bytes for PCR 0-23)
        let max_pcr = pcrs.iter().max().copied().unwrap_or(0);
        let size = ((max_pcr / 8) + 1).max(3) as usize;
        let mut pcr_select = vec![0u8; size];

        for &pcr in pcrs {
            let byte_idx = (pcr / 8) as usize;
            let bit_idx = pcr % 8;
            if byte_idx < pcr_select.len() {
                pcr_select[byte_idx] |= 1 << bit_idx;
            }
        }

        Self { hash, pcr_select }
    }

    pub fn sha256(pcrs: &[u32]) -> Self {
        Self::new(TpmAlgId::Sha256, pcrs)
    }

    /// Selected PCR indices in ascending order
    pub fn selected(&self) -> Vec<u32> {
        let mut pcrs = Vec::new();
        for (byte_idx, &byte) in self.pcr_select.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    pcrs.push((byte_idx * 8 + bit) as u32);
                }
            }
        }
        pcrs
    }
}

impl Marshal for TpmsPcrSelection {
    fn marshal(&self, buf: &mut WriteBuf) {
        buf.put_u16(self.hash.to_u16());
        buf.put_u8(self.pcr_select.len() as u8);
        buf.put_bytes(&self.pcr_select);
    }
}

impl Unmarshal for TpmsPcrSelection {
    fn unmarshal(buf: &mut ReadBuf) -> Result<Self> {
        let hash_alg = buf.get_u16()?;
        let hash = TpmAlgId::from_u16(hash_alg)
            .ok_or_else(|| anyhow::anyhow!("unknown hash algorithm: 0x{:04x}", hash_alg))?;
        let size = buf.get_u8()? as usize;
        let pcr_select = buf.get_bytes(size)?;
        Ok(Self { hash, pcr_select })
    }
}

/// TPML_PCR_SELECTION - List of PCR selections
#[derive(Debug, Clone, Default)]
pub struct TpmlPcrSelection {
    pub pcr_selections: Vec<TpmsPcrSelection>,
}

impl TpmlPcrSelection {
    pub fn single(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        Self {
            pcr_selections: vec![TpmsPcrSelection::new(hash, pcrs)],
        }
    }
}

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut WriteBuf) {
        buf.put_u32(self.pcr_selections.len() as u32);
        for sel in &self.pcr_selections {
            sel.marshal(buf);
        }
    }
}

impl Unmarshal for TpmlPcrSelection {
    fn unmarshal(buf: &mut ReadBuf) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        let mut pcr_selections = Vec::with_capacity(count);
        for _ in 0..count {
            pcr_selections.push(TpmsPcrSelection::unmarshal(buf)?);
        }
        Ok(Self { pcr_selections })
    }
}

/// TPML_DIGEST - List of digests
#[derive(Debug, Clone, Default)]
pub struct TpmlDigest {
    pub digests: Vec<Tpm2bDigest>,
}

impl Unmarshal for TpmlDigest {
    fn unmarshal(buf: &mut ReadBuf) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        let mut digests = Vec::with_capacity(count);
        for _ in 0..count {
            digests.push(Tpm2bDigest::unmarshal(buf)?);
        }
        Ok(Self { digests })
    }
}

/// TPMT_SYM_DEF - Symmetric algorithm definition
#[derive(Debug, Clone, Copy)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }

    pub fn aes_128_cfb() -> Self {
        Self {
            algorithm: TpmAlgId::Aes,
            key_bits: 128,
            mode: TpmAlgId::Cfb,
        }
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut WriteBuf) {
        buf.put_u16(self.algorithm.to_u16());
        if self.algorithm != TpmAlgId::Null {
            buf.put_u16(self.key_bits);
            buf.put_u16(self.mode.to_u16());
        }
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ReadBuf) -> Result<Self> {
        let alg = buf.get_u16()?;
        let algorithm = TpmAlgId::from_u16(alg)
            .ok_or_else(|| anyhow::anyhow!("unknown algorithm: 0x{:04x}", alg))?;
        if algorithm == TpmAlgId::Null {
            Ok(Self::null())
        } else {
            let key_bits = buf.get_u16()?;
            let mode_raw = buf.get_u16()?;
            let mode = TpmAlgId::from_u16(mode_raw)
                .ok_or_else(|| anyhow::anyhow!("unknown mode: 0x{:04x}", mode_raw))?;
            Ok(Self {
                algorithm,
                key_bits,
                mode,
            })
        }
    }
}

/// TPMT_RSA_SCHEME - RSA signature scheme
#[derive(Debug, Clone, Copy)]
pub struct TpmtRsaScheme {
    pub scheme: TpmAlgId,
    pub hash_alg: Option<TpmAlgId>,
}

impl TpmtRsaScheme {
    pub fn null() -> Self {
        Self {
            scheme: TpmAlgId::Null,
            hash_alg: None,
        }
    }
}

impl Marshal for TpmtRsaScheme {
    fn marshal(&self, buf: &mut WriteBuf) {
        buf.put_u16(self.scheme.to_u16());
        if let Some(hash) = self.hash_alg {
            buf.put_u16(hash.to_u16());
        }
    }
}

/// TPMS_RSA_PARMS - RSA key parameters
#[derive(Debug, Clone)]
pub struct TpmsRsaParms {
    pub symmetric: TpmtSymDef,
    pub scheme: TpmtRsaScheme,
    pub key_bits: u16,
    pub exponent: u32,
}

impl TpmsRsaParms {
    pub fn storage_key() -> Self {
        Self {
            symmetric: TpmtSymDef::aes_128_cfb(),
            scheme: TpmtRsaScheme::null(),
            key_bits: 2048,
            exponent: 0, // Default exponent (65537)
        }
    }
}

impl Marshal for TpmsRsaParms {
    fn marshal(&self, buf: &mut WriteBuf) {
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.key_bits);
        buf.put_u32(self.exponent);
    }
}

/// TPMS_KEYEDHASH_PARMS - Keyed hash parameters
///
/// Null scheme for sealed data objects; the HMAC scheme carries the inner
/// hash algorithm for signing keys.
#[derive(Debug, Clone, Copy)]
pub struct TpmsKeyedHashParms {
    pub scheme: TpmAlgId,
    pub hash_alg: Option<TpmAlgId>,
}

impl TpmsKeyedHashParms {
    pub fn null() -> Self {
        Self {
            scheme: TpmAlgId::Null,
            hash_alg: None,
        }
    }

    pub fn hmac(hash_alg: TpmAlgId) -> Self {
        Self {
            scheme: TpmAlgId::Hmac,
            hash_alg: Some(hash_alg),
        }
    }
}

impl Marshal for TpmsKeyedHashParms {
    fn marshal(&self, buf: &mut WriteBuf) {
        buf.put_u16(self.scheme.to_u16());
        if let Some(hash) = self.hash_alg {
            buf.put_u16(hash.to_u16());
        }
    }
}

/// TPMT_PUBLIC - Public area template
#[derive(Debug, Clone)]
pub struct TpmtPublic {
    pub type_alg: TpmAlgId,
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Tpm2bDigest,
    pub parameters: TpmtPublicParms,
    pub unique: TpmtPublicUnique,
}

/// TPMU_PUBLIC_PARMS - Public parameters union
#[derive(Debug, Clone)]
pub enum TpmtPublicParms {
    Rsa(TpmsRsaParms),
    KeyedHash(TpmsKeyedHashParms),
}

impl Marshal for TpmtPublicParms {
    fn marshal(&self, buf: &mut WriteBuf) {
        match self {
            TpmtPublicParms::Rsa(p) => p.marshal(buf),
            TpmtPublicParms::KeyedHash(p) => p.marshal(buf),
        }
    }
}

/// TPMU_PUBLIC_ID - Unique identifier union
#[derive(Debug, Clone)]
pub enum TpmtPublicUnique {
    Rsa(Vec<u8>),       // TPM2B_PUBLIC_KEY_RSA
    KeyedHash(Vec<u8>), // TPM2B_DIGEST
}

impl Marshal for TpmtPublicUnique {
    fn marshal(&self, buf: &mut WriteBuf) {
        match self {
            TpmtPublicUnique::Rsa(n) => buf.put_tpm2b(n),
            TpmtPublicUnique::KeyedHash(d) => buf.put_tpm2b(d),
        }
    }
}

impl TpmtPublic {
    /// RSA-2048 restricted storage key template, used both as the custody
    /// parent and as the storage root key for sealing
    pub fn rsa_storage_key() -> Self {
        Self {
            type_alg: TpmAlgId::Rsa,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_user_with_auth()
                .with_restricted()
                .with_decrypt(),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::Rsa(TpmsRsaParms::storage_key()),
            unique: TpmtPublicUnique::Rsa(Vec::new()),
        }
    }

    /// HMAC-SHA256 signing key template for imported secrets
    pub fn hmac_key() -> Self {
        Self {
            type_alg: TpmAlgId::KeyedHash,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_user_with_auth()
                .with_sign_encrypt(),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::KeyedHash(TpmsKeyedHashParms::hmac(TpmAlgId::Sha256)),
            unique: TpmtPublicUnique::KeyedHash(Vec::new()),
        }
    }

    /// Sealed data object template
    pub fn sealed_object(policy_digest: Tpm2bDigest) -> Self {
        // If policy_digest is empty, use userWithAuth; otherwise use adminWithPolicy
        let object_attributes = if policy_digest.buffer.is_empty() {
            TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_user_with_auth()
        } else {
            TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_admin_with_policy()
        };

        Self {
            type_alg: TpmAlgId::KeyedHash,
            name_alg: TpmAlgId::Sha256,
            object_attributes,
            auth_policy: policy_digest,
            parameters: TpmtPublicParms::KeyedHash(TpmsKeyedHashParms::null()),
            unique: TpmtPublicUnique::KeyedHash(Vec::new()),
        }
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut WriteBuf) {
        buf.put_u16(self.type_alg.to_u16());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        self.auth_policy.marshal(buf);
        self.parameters.marshal(buf);
        self.unique.marshal(buf);
    }
}

/// TPM2B_PUBLIC - Public area with size prefix
#[derive(Debug, Clone)]
pub struct Tpm2bPublic {
    pub public_area: Vec<u8>, // Raw marshalled TPMT_PUBLIC
}

impl Tpm2bPublic {
    pub fn from_template(template: &TpmtPublic) -> Self {
        Self {
            public_area: template.to_bytes(),
        }
    }
}

impl Marshal for Tpm2bPublic {
    fn marshal(&self, buf: &mut WriteBuf) {
        buf.put_tpm2b(&self.public_area);
    }
}

impl Unmarshal for Tpm2bPublic {
    fn unmarshal(buf: &mut ReadBuf) -> Result<Self> {
        let public_area = buf.get_tpm2b()?;
        Ok(Self { public_area })
    }
}

/// TPM2B_PRIVATE - Private area
#[derive(Debug, Clone)]
pub struct Tpm2bPrivate {
    pub buffer: Vec<u8>,
}

impl Marshal for Tpm2bPrivate {
    fn marshal(&self, buf: &mut WriteBuf) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bPrivate {
    fn unmarshal(buf: &mut ReadBuf) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// TPM2B_SENSITIVE_CREATE - Sensitive data for object creation
#[derive(Debug, Clone, Default)]
pub struct Tpm2bSensitiveCreate {
    pub user_auth: Tpm2bAuth,
    pub data: Tpm2bSensitiveData,
}

impl Tpm2bSensitiveCreate {
    /// Carry caller-supplied secret bytes into the created object
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            user_auth: Tpm2bAuth::empty(),
            data: Tpm2bSensitiveData::new(data),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl Marshal for Tpm2bSensitiveCreate {
    fn marshal(&self, buf: &mut WriteBuf) {
        // First marshal the inner structure
        let mut inner = WriteBuf::new();
        self.user_auth.marshal(&mut inner);
        self.data.marshal(&mut inner);
        // Then wrap with size
        buf.put_tpm2b(inner.as_bytes());
    }
}

/// TPMT_HA - Hash value with algorithm
#[derive(Debug, Clone)]
pub struct TpmtHa {
    pub hash_alg: TpmAlgId,
    pub digest: Vec<u8>,
}

impl TpmtHa {
    pub fn sha256(digest: Vec<u8>) -> Self {
        Self {
            hash_alg: TpmAlgId::Sha256,
            digest,
        }
    }
}

impl Marshal for TpmtHa {
    fn marshal(&self, buf: &mut WriteBuf) {
        buf.put_u16(self.hash_alg.to_u16());
        buf.put_bytes(&self.digest);
    }
}

/// TPML_DIGEST_VALUES - List of digest values for PCR extend
#[derive(Debug, Clone)]
pub struct TpmlDigestValues {
    pub digests: Vec<TpmtHa>,
}

impl TpmlDigestValues {
    pub fn single(digest: TpmtHa) -> Self {
        Self {
            digests: vec![digest],
        }
    }
}

impl Marshal for TpmlDigestValues {
    fn marshal(&self, buf: &mut WriteBuf) {
        buf.put_u32(self.digests.len() as u32);
        for d in &self.digests {
            d.marshal(buf);
        }
    }
}

/// RSA public key extracted from a returned TPMT_PUBLIC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    pub exponent: u32,
    pub modulus: Vec<u8>,
}

impl RsaPublicKey {
    /// Parse the public area returned by CreatePrimary for an RSA key.
    /// An exponent of zero in the area means the default 65537.
    pub fn parse(public_area: &[u8]) -> Result<Self> {
        let mut buf = ReadBuf::new(public_area);

        let type_raw = buf.get_u16()?;
        if type_raw != TpmAlgId::Rsa.to_u16() {
            bail!("not an RSA public area: type 0x{:04x}", type_raw);
        }
        let _name_alg = buf.get_u16()?;
        let _attributes = buf.get_u32()?;
        let _auth_policy = buf.get_tpm2b()?;
        let _symmetric = TpmtSymDef::unmarshal(&mut buf)?;
        let scheme = buf.get_u16()?;
        if scheme != TpmAlgId::Null.to_u16() {
            let _scheme_hash = buf.get_u16()?;
        }
        let _key_bits = buf.get_u16()?;
        let exponent = buf.get_u32()?;
        let modulus = buf.get_tpm2b()?;

        Ok(Self {
            exponent: if exponent == 0 { 65537 } else { exponent },
            modulus,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcr_selection_bitmap() {
        let sel = TpmsPcrSelection::sha256(&[0, 1, 2, 7]);
        assert_eq!(sel.hash, TpmAlgId::Sha256);
        // PCR 0, 1, 2, 7 = bits 0, 1, 2, 7 = 0b10000111 = 0x87
        assert_eq!(sel.pcr_select[0], 0x87);
        assert_eq!(sel.pcr_select.len(), 3);
    }

    #[test]
    fn test_pcr_selection_high_slots() {
        let sel = TpmsPcrSelection::sha256(&[8, 9, 16, 23]);
        assert_eq!(sel.pcr_select, vec![0x00, 0x03, 0x81]);
    }

    #[test]
    fn test_rsa_public_parse() {
        // Marshal a storage template with a known modulus and read it back
        let mut template = TpmtPublic::rsa_storage_key();
        template.unique = TpmtPublicUnique::Rsa(vec![0xAB; 256]);

        let parsed = RsaPublicKey::parse(&template.to_bytes()).unwrap();
        assert_eq!(parsed.exponent, 65537); // zero in the area means default
        assert_eq!(parsed.modulus, vec![0xAB; 256]);
    }

    #[test]
    fn test_rsa_public_parse_rejects_keyed_hash() {
        let template = TpmtPublic::hmac_key();
        assert!(RsaPublicKey::parse(&template.to_bytes()).is_err());
    }
}
