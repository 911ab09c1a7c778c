// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Boot-stage secret ladder over PCR 10 and PCR 16
//!
//! PCR 16 holds a one-way per-boot session nonce; PCR 10 accumulates
//! boot-stage residues. A secret released by unsealing never leaves the
//! process: it is folded into PCR 10 and observable only through keyed
//! derivations. The ladder keeps no state of its own — every transition is
//! a PCR read or extend.

use anyhow::{bail, Context as _, Result};
use blake2::digest::consts::U32;
use blake2::digest::{FixedOutput, KeyInit, Update};
use blake2::{Blake2b, Blake2bMac, Digest};
use std::io::Read;
use tpm2::{tpm_rh, RsaPublicKey, TpmAlgId, TpmContext, TpmlPcrSelection, TpmtPublic};
use tracing::info;

use crate::sealed;

type Blake2b256 = Blake2b<U32>;
type Blake2bMac256 = Blake2bMac<U32>;

/// Session-nonce slot; all-zero until `initialize` runs
const SESSION_PCR: u32 = 16;
/// Boot-stage residue slot, extended once per `decryptsec`
const STAGE_PCR: u32 = 10;

/// PCRs bound by the seal policy. PCR 1 is left out: firmware rewrites it
/// when the boot order changes.
const SEAL_PCRS: [u32; 15] = [0, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

/// Keyed BLAKE2b with a 32-byte output
fn mac32(key: &[u8], msg: &[u8]) -> Result<[u8; 32]> {
    let mut mac = Blake2bMac256::new_from_slice(key)
        .map_err(|_| anyhow::anyhow!("MAC key longer than 64 bytes"))?;
    Update::update(&mut mac, msg);
    Ok(mac.finalize_fixed().into())
}

fn read_pcr(ctx: &mut TpmContext, pcr: u32) -> Result<[u8; 32]> {
    let value = ctx.pcr_read_single(pcr, TpmAlgId::Sha256)?;
    value
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("PCR {} has unexpected digest length", pcr))
}

fn pcr_is_zero(ctx: &mut TpmContext, pcr: u32) -> Result<bool> {
    Ok(read_pcr(ctx, pcr)? == [0u8; 32])
}

/// Fail unless the boot session has been initialized
fn assert_init(ctx: &mut TpmContext) -> Result<()> {
    if pcr_is_zero(ctx, SESSION_PCR)? {
        bail!("pcr16 is zero, not yet initialized");
    }
    Ok(())
}

/// Extend PCR 16 with fresh TPM randomness, once per boot.
///
/// The nonce is not recoverable after the process exits; only its PCR
/// residue remains.
pub fn initialize(ctx: &mut TpmContext) -> Result<()> {
    if !pcr_is_zero(ctx, SESSION_PCR)? {
        bail!("already initialized");
    }
    info!("initializing boot session nonce");
    let nonce = ctx.get_random(32)?;
    ctx.pcr_extend(SESSION_PCR, &nonce)?;
    Ok(())
}

/// The boot-session nonce as hex
pub fn sess(ctx: &mut TpmContext) -> Result<String> {
    assert_init(ctx)?;
    Ok(hex::encode(read_pcr(ctx, SESSION_PCR)?))
}

/// Derive a boot-stage secret: keyed BLAKE2b of `key` under the current
/// PCR 10 value
pub fn sec(ctx: &mut TpmContext, key: &str) -> Result<String> {
    assert_init(ctx)?;
    let stage = read_pcr(ctx, STAGE_PCR)?;
    if stage == [0u8; 32] {
        bail!("PCR[10] is zero, not yet initialized");
    }
    Ok(hex::encode(mac32(&stage, key.as_bytes())?))
}

/// Stable machine identity: BLAKE2b-256 over the SRK's RSA public key
/// (little-endian u64 exponent, then the modulus).
///
/// Constant across reboots; changes only when the owner hierarchy is reset.
fn machine_id(ctx: &mut TpmContext) -> Result<[u8; 32]> {
    let (srk, public_area) = ctx
        .create_primary(tpm_rh::OWNER, &TpmtPublic::rsa_storage_key())
        .context("creating storage root key")?;
    let public = RsaPublicKey::parse(&public_area);
    let _ = ctx.flush_context(srk);
    let public = public?;
    Ok(fingerprint(&public))
}

fn fingerprint(public: &RsaPublicKey) -> [u8; 32] {
    let mut hash = Blake2b256::new();
    Digest::update(&mut hash, (public.exponent as u64).to_le_bytes());
    Digest::update(&mut hash, &public.modulus);
    hash.finalize().into()
}

/// Derive an identifier bound to this TPM: keyed BLAKE2b of `s` under the
/// machine identity
pub fn id(ctx: &mut TpmContext, s: &str) -> Result<String> {
    let key = machine_id(ctx)?;
    Ok(hex::encode(mac32(&key, s.as_bytes())?))
}

/// Seal 32 fresh random bytes to the current platform state and return the
/// encoded blob
pub fn mksec(ctx: &mut TpmContext) -> Result<String> {
    let secret = ctx.get_random(32)?;
    let selection = TpmlPcrSelection::single(TpmAlgId::Sha256, &SEAL_PCRS);

    let (srk, _) = ctx
        .create_primary(tpm_rh::OWNER, &TpmtPublic::rsa_storage_key())
        .context("creating storage root key")?;
    let result = ctx.seal(&secret, srk, &selection);
    let _ = ctx.flush_context(srk);
    let (public, private) = result.context("sealing boot-stage secret")?;

    Ok(sealed::encode(&public, &private, &SEAL_PCRS))
}

/// Unseal a sealed blob and fold the released secret into PCR 10.
///
/// Fails when the platform measurements differ from seal time. The secret
/// itself is never returned; only its keyed residue lands in PCR 10.
pub fn decryptsec(ctx: &mut TpmContext, file: &str, key: &str) -> Result<()> {
    assert_init(ctx)?;

    let encoded = read_input(file)?;
    let encoded = String::from_utf8(encoded).context("sealed blob file is not text")?;
    let blob = sealed::decode(encoded.trim())?;

    let (srk, _) = ctx
        .create_primary(tpm_rh::OWNER, &TpmtPublic::rsa_storage_key())
        .context("creating storage root key")?;
    let result = ctx.unseal(&blob.public, &blob.private, srk, &blob.selection());
    let _ = ctx.flush_context(srk);
    let secret = result.context("unsealing boot-stage secret")?;

    let residue = mac32(&secret, key.as_bytes())?;
    ctx.pcr_extend(STAGE_PCR, &residue)?;
    eprintln!("Secret placed in PCR 10");
    Ok(())
}

/// Print the whole SHA-256 bank
pub fn print_pcrs(ctx: &mut TpmContext) -> Result<()> {
    // The TPM returns at most 8 digests per read
    for base in [0u32, 8, 16] {
        let pcrs: Vec<u32> = (base..base + 8).collect();
        let selection = TpmlPcrSelection::single(TpmAlgId::Sha256, &pcrs);
        let mut values = ctx.pcr_read(&selection)?;
        values.sort_by_key(|(idx, _)| *idx);
        for (idx, value) in values {
            println!("PCR[{}] = {}", idx, hex::encode(value));
        }
    }
    Ok(())
}

fn read_input(path: &str) -> Result<Vec<u8>> {
    if path == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("reading stdin")?;
        Ok(buf)
    } else {
        Ok(fs_err::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac32_is_keyed() {
        let a = mac32(b"key-one", b"message").unwrap();
        let b = mac32(b"key-two", b"message").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, mac32(b"key-one", b"message").unwrap());
    }

    #[test]
    fn test_mac32_rejects_long_keys() {
        assert!(mac32(&[0u8; 65], b"message").is_err());
        assert!(mac32(&[0u8; 64], b"message").is_ok());
    }

    #[test]
    fn test_fingerprint_depends_on_both_fields() {
        let base = RsaPublicKey {
            exponent: 65537,
            modulus: vec![0x11; 256],
        };
        let other_exponent = RsaPublicKey {
            exponent: 3,
            ..base.clone()
        };
        let other_modulus = RsaPublicKey {
            modulus: vec![0x22; 256],
            ..base.clone()
        };

        assert_eq!(fingerprint(&base), fingerprint(&base));
        assert_ne!(fingerprint(&base), fingerprint(&other_exponent));
        assert_ne!(fingerprint(&base), fingerprint(&other_modulus));
    }

    #[test]
    fn test_seal_pcrs_exclude_pcr1() {
        assert!(!SEAL_PCRS.contains(&1));
        assert!(SEAL_PCRS.contains(&0));
        assert!(SEAL_PCRS.contains(&15));
        assert_eq!(SEAL_PCRS.len(), 15);
    }
}
