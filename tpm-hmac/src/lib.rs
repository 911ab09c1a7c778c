// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM-resident HMAC keys
//!
//! Wraps a caller-supplied secret as a keyed-hash signing object under a
//! fresh storage primary, hands it back as an opaque hex-encoded context
//! blob, and later rehydrates the blob to drive chunked HMAC-SHA256
//! sequences through the device. The blob is only usable by the TPM
//! instance and power cycle that produced it.

use anyhow::{Context as _, Result};
use tpm2::{tpm_rh, TpmAlgId, TpmContext, TpmtPublic};
use tracing::debug;

/// Largest chunk fed to a single SequenceUpdate
const CHUNK: usize = 1024;

/// Import a secret as a TPM-resident HMAC-SHA256 key.
///
/// Creates a storage primary under the owner hierarchy, wraps the secret as
/// a keyed-hash child beneath it, loads the pair, and saves the loaded
/// object's context. Both transient handles are flushed on every path; only
/// the hex-encoded context blob survives.
pub fn import_key(ctx: &mut TpmContext, secret: &[u8]) -> Result<String> {
    let (primary, _) = ctx
        .create_primary(tpm_rh::OWNER, &TpmtPublic::rsa_storage_key())
        .context("creating primary key")?;

    let blob = import_under(ctx, primary, secret);
    let _ = ctx.flush_context(primary);
    blob
}

fn import_under(ctx: &mut TpmContext, parent: u32, secret: &[u8]) -> Result<String> {
    let (private, public) = ctx
        .create_keyed_hash(parent, secret)
        .context("creating keyed-hash object")?;

    let handle = ctx
        .load(parent, &private, &public)
        .context("loading keyed-hash object")?;

    let saved = ctx.context_save(handle).context("saving key context");
    let _ = ctx.flush_context(handle);
    let saved = saved?;

    debug!(
        "imported {} byte secret as a {} byte context blob",
        secret.len(),
        saved.len()
    );
    Ok(hex::encode(saved))
}

/// A loaded TPM HMAC key.
///
/// Owns the device context and the transient key handle for its lifetime;
/// the handle is flushed on drop. One `Hmacer` computes one HMAC at a time.
pub struct Hmacer {
    ctx: TpmContext,
    handle: u32,
}

impl Hmacer {
    /// Rehydrate a key blob produced by [`import_key`].
    ///
    /// Fails on malformed hex and when the TPM rejects the context (wrong
    /// instance or power cycle).
    pub fn load(mut ctx: TpmContext, blob: &str) -> Result<Self> {
        let context = hex::decode(blob).context("malformed key blob hex")?;
        let handle = ctx
            .context_load(&context)
            .context("loading key context")?;

        debug!("hmac key loaded at 0x{:08x}", handle);
        Ok(Self { ctx, handle })
    }

    /// Compute HMAC-SHA256 of `data` with the TPM-resident key.
    ///
    /// Streams the input through an HMAC sequence in 1024-byte chunks. The
    /// sequence handle is flushed on every path; on successful completion
    /// the TPM has already retired it and the flush is a no-op that may
    /// fail, which is ignored.
    pub fn hmac(&mut self, data: &[u8]) -> Result<[u8; 32]> {
        let seq = self
            .ctx
            .hmac_start(self.handle, &[], TpmAlgId::Sha256)
            .context("starting hmac sequence")?;

        let digest = self.feed(seq, data);
        let _ = self.ctx.flush_context(seq);
        digest
    }

    fn feed(&mut self, seq: u32, mut data: &[u8]) -> Result<[u8; 32]> {
        while data.len() > CHUNK {
            self.ctx
                .sequence_update(seq, &data[..CHUNK])
                .context("updating hmac sequence")?;
            data = &data[CHUNK..];
        }

        let digest = self
            .ctx
            .sequence_complete(seq, data)
            .context("completing hmac sequence")?;

        digest
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("unexpected digest length {}", digest.len()))
    }

    /// The underlying TPM context, for capability queries
    pub fn context_mut(&mut self) -> &mut TpmContext {
        &mut self.ctx
    }
}

impl Drop for Hmacer {
    fn drop(&mut self) {
        let _ = self.ctx.flush_context(self.handle);
    }
}
