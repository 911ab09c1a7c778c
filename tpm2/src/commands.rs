// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command implementations
//!
//! This module provides high-level TPM operations over one open device.

use anyhow::{Context, Result};
use tracing::debug;

use super::buf::Unmarshal;
use super::constants::*;
use super::device::TpmDevice;
use super::frame::{CommandFrame, Reply};
use super::session::{compute_pcr_digest, AuthSession};
use super::types::*;

/// Pure Rust TPM context
///
/// Owns the device handle; every method issues exactly one command sequence
/// and leaves no transient handle behind beyond what it returns.
pub struct TpmContext {
    device: TpmDevice,
}

impl TpmContext {
    /// Create a new TPM context with the given device path
    pub fn new(tcti_path: Option<&str>) -> Result<Self> {
        let device = match tcti_path {
            Some(path) => TpmDevice::open(path)?,
            None => TpmDevice::detect()?,
        };

        Ok(Self { device })
    }

    /// Get the device path
    pub fn device_path(&self) -> &str {
        self.device.path()
    }

    // ==================== PCR Operations ====================

    /// Read PCR values for the given selection (at most 8 PCRs per call)
    pub fn pcr_read(&mut self, pcr_selection: &TpmlPcrSelection) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut cmd = CommandFrame::new(TpmCc::PcrRead);
        cmd.add(pcr_selection);

        let reply = self.device.execute(&cmd.finalize())?;
        reply.ensure_success().context("PCR_Read failed")?;

        let mut buf = reply.data_buffer();
        let _update_counter = buf.get_u32()?;
        let pcr_selection_out = TpmlPcrSelection::unmarshal(&mut buf)?;
        let digest_list = TpmlDigest::unmarshal(&mut buf)?;

        // Map digests to PCR indices
        let mut result = Vec::new();
        let mut digest_idx = 0;

        for sel in &pcr_selection_out.pcr_selections {
            for pcr_idx in sel.selected() {
                if digest_idx < digest_list.digests.len() {
                    result.push((pcr_idx, digest_list.digests[digest_idx].buffer.clone()));
                    digest_idx += 1;
                }
            }
        }

        Ok(result)
    }

    /// Read a single PCR value
    pub fn pcr_read_single(&mut self, pcr_idx: u32, hash_alg: TpmAlgId) -> Result<Vec<u8>> {
        let selection = TpmlPcrSelection::single(hash_alg, &[pcr_idx]);
        let values = self.pcr_read(&selection)?;

        values
            .into_iter()
            .find(|(idx, _)| *idx == pcr_idx)
            .map(|(_, v)| v)
            .ok_or_else(|| anyhow::anyhow!("PCR {} not found in response", pcr_idx))
    }

    /// Extend a PCR in the SHA-256 bank with a digest value
    pub fn pcr_extend(&mut self, pcr: u32, digest: &[u8]) -> Result<()> {
        let digest_values = TpmlDigestValues::single(TpmtHa::sha256(digest.to_vec()));

        let mut cmd = CommandFrame::with_sessions(TpmCc::PcrExtend);
        // pcrHandle
        cmd.add_handle(pcr);
        // Authorization area
        cmd.add_null_auth_area();
        // digests
        cmd.add(&digest_values);

        let reply = self.device.execute(&cmd.finalize())?;
        reply
            .ensure_success()
            .with_context(|| format!("PCR_Extend failed for PCR {}", pcr))?;

        debug!("extended PCR {}", pcr);
        Ok(())
    }

    // ==================== Random Number Generation ====================

    /// Generate random bytes using the TPM's hardware RNG
    pub fn get_random(&mut self, num_bytes: usize) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity(num_bytes);

        // TPM may return fewer bytes than requested, so loop
        while result.len() < num_bytes {
            let remaining = num_bytes - result.len();
            let request_size = remaining.min(48) as u16; // TPM typically limits to 48-64 bytes

            let mut cmd = CommandFrame::new(TpmCc::GetRandom);
            cmd.add_u16(request_size);

            let reply = self.device.execute(&cmd.finalize())?;
            reply.ensure_success().context("GetRandom failed")?;

            let mut buf = reply.data_buffer();
            let random_bytes = buf.get_tpm2b()?;
            result.extend_from_slice(&random_bytes);
        }

        result.truncate(num_bytes);
        Ok(result)
    }

    // ==================== Key Operations ====================

    /// Create a primary key in the specified hierarchy
    pub fn create_primary(
        &mut self,
        hierarchy: u32,
        template: &TpmtPublic,
    ) -> Result<(u32, Vec<u8>)> {
        let public = Tpm2bPublic::from_template(template);

        let mut cmd = CommandFrame::with_sessions(TpmCc::CreatePrimary);
        // primaryHandle (hierarchy)
        cmd.add_handle(hierarchy);
        // Authorization area
        cmd.add_null_auth_area();
        // inSensitive (empty)
        cmd.add(&Tpm2bSensitiveCreate::empty());
        // inPublic
        cmd.add(&public);
        // outsideInfo (empty)
        cmd.add_tpm2b_empty();
        // creationPCR (empty)
        cmd.add(&TpmlPcrSelection::default());

        let reply = self.device.execute(&cmd.finalize())?;
        reply.ensure_success().context("CreatePrimary failed")?;

        // For commands with sessions, the response format is:
        // - Handle (4 bytes) - BEFORE parameter size
        // - Parameter size (4 bytes)
        // - Parameters...
        let mut buf = reply.data_buffer();
        let handle = buf.get_u32()?;
        let _param_size = buf.get_u32()?;

        let out_public = Tpm2bPublic::unmarshal(&mut buf)?;

        debug!("created primary key with handle 0x{:08x}", handle);
        Ok((handle, out_public.public_area))
    }

    /// Create a keyed-hash HMAC object under a parent, with the caller's
    /// secret bytes carried verbatim in the sensitive area.
    ///
    /// Returns the (private, public) pair for a subsequent Load.
    pub fn create_keyed_hash(
        &mut self,
        parent_handle: u32,
        secret: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let public = Tpm2bPublic::from_template(&TpmtPublic::hmac_key());

        let mut cmd = CommandFrame::with_sessions(TpmCc::Create);
        // parentHandle
        cmd.add_handle(parent_handle);
        // Authorization area
        cmd.add_null_auth_area();
        // inSensitive (contains the secret)
        cmd.add(&Tpm2bSensitiveCreate::with_data(secret.to_vec()));
        // inPublic
        cmd.add(&public);
        // outsideInfo (empty)
        cmd.add_tpm2b_empty();
        // creationPCR (empty)
        cmd.add(&TpmlPcrSelection::default());

        let reply = self.device.execute(&cmd.finalize())?;
        reply
            .ensure_success()
            .context("Create (with sensitive) failed")?;

        let mut buf = reply.skip_parameter_size()?;
        let out_private = Tpm2bPrivate::unmarshal(&mut buf)?;
        let out_public = Tpm2bPublic::unmarshal(&mut buf)?;

        debug!("created keyed-hash object, {} byte secret", secret.len());
        Ok((out_private.buffer, out_public.public_area))
    }

    /// Load a (private, public) pair under a parent, returning the transient
    /// object handle
    pub fn load(&mut self, parent_handle: u32, private: &[u8], public: &[u8]) -> Result<u32> {
        let mut cmd = CommandFrame::with_sessions(TpmCc::Load);
        // parentHandle
        cmd.add_handle(parent_handle);
        // Authorization area
        cmd.add_null_auth_area();
        // inPrivate
        cmd.add_tpm2b(private);
        // inPublic
        cmd.add_tpm2b(public);

        let reply = self.device.execute(&cmd.finalize())?;
        reply.ensure_success().context("Load failed")?;

        // Handle comes before the parameter size
        let mut buf = reply.data_buffer();
        let handle = buf.get_u32()?;

        debug!("loaded object with handle 0x{:08x}", handle);
        Ok(handle)
    }

    /// Save a loaded object's context as an opaque blob.
    ///
    /// The returned bytes are only meaningful to the TPM instance and power
    /// cycle that produced them and are never parsed here.
    pub fn context_save(&mut self, handle: u32) -> Result<Vec<u8>> {
        let mut cmd = CommandFrame::new(TpmCc::ContextSave);
        cmd.add_handle(handle);

        let reply = self.device.execute(&cmd.finalize())?;
        reply.ensure_success().context("ContextSave failed")?;

        debug!(
            "saved context for 0x{:08x}: {} bytes",
            handle,
            reply.data.len()
        );
        Ok(reply.data)
    }

    /// Load a previously saved context blob, returning the new transient
    /// handle
    pub fn context_load(&mut self, context: &[u8]) -> Result<u32> {
        let mut cmd = CommandFrame::new(TpmCc::ContextLoad);
        cmd.add_bytes(context);

        let reply = self.device.execute(&cmd.finalize())?;
        reply.ensure_success().context("ContextLoad failed")?;

        let mut buf = reply.data_buffer();
        let handle = buf.get_u32()?;

        debug!("loaded context with handle 0x{:08x}", handle);
        Ok(handle)
    }

    /// Flush a context (handle)
    pub fn flush_context(&mut self, handle: u32) -> Result<()> {
        let mut cmd = CommandFrame::new(TpmCc::FlushContext);
        cmd.add_handle(handle);

        let reply = self.device.execute(&cmd.finalize())?;
        reply.ensure_success().context("FlushContext failed")?;

        Ok(())
    }

    /// List currently loaded transient object handles
    pub fn transient_handles(&mut self) -> Result<Vec<u32>> {
        let mut cmd = CommandFrame::new(TpmCc::GetCapability);
        // capability
        cmd.add_u32(TpmCap::Handles.to_u32());
        // property (first handle in the transient range)
        cmd.add_u32(TRANSIENT_FIRST);
        // propertyCount
        cmd.add_u32(64);

        let reply = self.device.execute(&cmd.finalize())?;
        reply.ensure_success().context("GetCapability failed")?;

        let mut buf = reply.data_buffer();
        let _more_data = buf.get_u8()?;
        let _capability = buf.get_u32()?;
        let count = buf.get_u32()? as usize;

        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            let handle = buf.get_u32()?;
            if handle >> 24 == TRANSIENT_FIRST >> 24 {
                handles.push(handle);
            }
        }

        Ok(handles)
    }

    /// Flush every transient handle still loaded
    pub fn flush_transient(&mut self) -> Result<()> {
        for handle in self.transient_handles()? {
            let _ = self.flush_context(handle);
        }
        Ok(())
    }

    // ==================== Seal/Unseal Operations ====================

    /// Seal data to the TPM with a SHA-256 PCR policy
    pub fn seal(
        &mut self,
        data: &[u8],
        parent_handle: u32,
        pcr_selection: &TpmlPcrSelection,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        // Compute policy digest if PCR selection is not empty
        let policy_digest = if pcr_selection.pcr_selections.is_empty() {
            // No PCR policy - use empty authPolicy (zero length, not zero-filled)
            vec![]
        } else {
            let trial_session = AuthSession::start_trial(&mut self.device, TpmAlgId::Sha256)?;

            let pcr_digest =
                compute_pcr_digest(&mut self.device, pcr_selection, TpmAlgId::Sha256)?;

            trial_session.policy_pcr(&mut self.device, &pcr_digest, pcr_selection)?;
            let digest = trial_session.get_digest(&mut self.device);
            let _ = trial_session.flush(&mut self.device);
            digest?
        };

        let template = TpmtPublic::sealed_object(Tpm2bDigest::new(policy_digest));
        let public = Tpm2bPublic::from_template(&template);

        let mut cmd = CommandFrame::with_sessions(TpmCc::Create);
        // parentHandle
        cmd.add_handle(parent_handle);
        // Authorization area
        cmd.add_null_auth_area();
        // inSensitive (contains the data to seal)
        cmd.add(&Tpm2bSensitiveCreate::with_data(data.to_vec()));
        // inPublic
        cmd.add(&public);
        // outsideInfo (empty)
        cmd.add_tpm2b_empty();
        // creationPCR (empty)
        cmd.add(&TpmlPcrSelection::default());

        let reply = self.device.execute(&cmd.finalize())?;
        reply.ensure_success().context("Create (seal) failed")?;

        let mut buf = reply.skip_parameter_size()?;
        let out_private = Tpm2bPrivate::unmarshal(&mut buf)?;
        let out_public = Tpm2bPublic::unmarshal(&mut buf)?;

        debug!("sealed {} bytes to TPM with PCR policy", data.len());

        Ok((out_public.public_area, out_private.buffer))
    }

    /// Unseal data; fails if the current PCR values do not satisfy the
    /// policy the blob was sealed under
    pub fn unseal(
        &mut self,
        pub_bytes: &[u8],
        priv_bytes: &[u8],
        parent_handle: u32,
        pcr_selection: &TpmlPcrSelection,
    ) -> Result<Vec<u8>> {
        let object_handle = self.load(parent_handle, priv_bytes, pub_bytes)?;

        // The loaded object is flushed on every path, success or error
        let result = self.unseal_loaded(object_handle, pcr_selection);
        let _ = self.flush_context(object_handle);
        result
    }

    fn unseal_loaded(
        &mut self,
        object_handle: u32,
        pcr_selection: &TpmlPcrSelection,
    ) -> Result<Vec<u8>> {
        let reply = if pcr_selection.pcr_selections.is_empty() {
            // No PCR policy - use null auth
            let mut cmd = CommandFrame::with_sessions(TpmCc::Unseal);
            cmd.add_handle(object_handle);
            cmd.add_null_auth_area();
            self.device.execute(&cmd.finalize())?
        } else {
            let policy_session = AuthSession::start_policy(&mut self.device, TpmAlgId::Sha256)?;
            let reply = self.unseal_with_policy(object_handle, &policy_session, pcr_selection);
            let _ = policy_session.flush(&mut self.device);
            reply?
        };

        reply.ensure_success().context("Unseal failed")?;

        let mut buf = reply.skip_parameter_size()?;
        let data = buf.get_tpm2b()?;

        debug!("unsealed {} bytes from TPM", data.len());
        Ok(data)
    }

    fn unseal_with_policy(
        &mut self,
        object_handle: u32,
        session: &AuthSession,
        pcr_selection: &TpmlPcrSelection,
    ) -> Result<Reply> {
        let pcr_digest = compute_pcr_digest(&mut self.device, pcr_selection, TpmAlgId::Sha256)?;
        session.policy_pcr(&mut self.device, &pcr_digest, pcr_selection)?;

        let mut cmd = CommandFrame::with_sessions(TpmCc::Unseal);
        cmd.add_handle(object_handle);
        cmd.add_policy_auth(session.handle);
        self.device.execute(&cmd.finalize())
    }

    // ==================== HMAC Sequences ====================

    /// Start an HMAC sequence over a loaded keyed-hash object.
    ///
    /// HMAC_Start is framed directly: sessions tag, the key handle, one
    /// password authorization carrying the sequence auth, then the same
    /// sequence auth again as a length-prefixed parameter followed by the
    /// hash selector. The duplication is part of the command's definition.
    pub fn hmac_start(&mut self, key_handle: u32, auth: &[u8], hash_alg: TpmAlgId) -> Result<u32> {
        let mut cmd = CommandFrame::with_sessions(TpmCc::HmacStart);
        // handle of the loaded HMAC key
        cmd.add_handle(key_handle);
        // Authorization area
        cmd.add_password_auth(auth);
        // auth (sequence auth, again)
        cmd.add_tpm2b(auth);
        // hashAlg
        cmd.add_u16(hash_alg.to_u16());

        let reply = self.device.execute(&cmd.finalize())?;
        reply.ensure_success().context("HMAC_Start failed")?;

        let mut buf = reply.data_buffer();
        let seq_handle = buf.get_u32()?;

        debug!("started HMAC sequence 0x{:08x}", seq_handle);
        Ok(seq_handle)
    }

    /// Feed a chunk into a running sequence
    pub fn sequence_update(&mut self, seq_handle: u32, chunk: &[u8]) -> Result<()> {
        let mut cmd = CommandFrame::with_sessions(TpmCc::SequenceUpdate);
        // sequenceHandle
        cmd.add_handle(seq_handle);
        // Authorization area
        cmd.add_null_auth_area();
        // buffer
        cmd.add_tpm2b(chunk);

        let reply = self.device.execute(&cmd.finalize())?;
        reply.ensure_success().context("SequenceUpdate failed")?;

        Ok(())
    }

    /// Complete a sequence with the final chunk, returning the digest.
    ///
    /// The TPM retires the sequence handle on success; the validation ticket
    /// in the response is ignored.
    pub fn sequence_complete(&mut self, seq_handle: u32, rest: &[u8]) -> Result<Vec<u8>> {
        let mut cmd = CommandFrame::with_sessions(TpmCc::SequenceComplete);
        // sequenceHandle
        cmd.add_handle(seq_handle);
        // Authorization area
        cmd.add_null_auth_area();
        // buffer
        cmd.add_tpm2b(rest);
        // hierarchy for the validation ticket
        cmd.add_u32(tpm_rh::NULL);

        let reply = self.device.execute(&cmd.finalize())?;
        reply.ensure_success().context("SequenceComplete failed")?;

        let mut buf = reply.skip_parameter_size()?;
        let digest = buf.get_tpm2b()?;

        Ok(digest)
    }
}
