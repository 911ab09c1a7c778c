// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM 2.0 implementation
//!
//! This crate provides TPM 2.0 commands, communicating directly with the TPM
//! device without C library dependencies.
//!
//! ## Features
//!
//! - **Cross-compilation friendly**: Easy to cross-compile for different targets
//! - **Direct device communication**: Talks directly to `/dev/tpmrm0` or `/dev/tpm0`
//!
//! ## Supported Commands
//!
//! - PCR operations: `PCR_Read`, `PCR_Extend`
//! - Key operations: `CreatePrimary`, `Create` (including create-with-sensitive),
//!   `Load`, `ContextSave`, `ContextLoad`, `FlushContext`
//! - Sealing: `Seal`, `Unseal` with PCR policy
//! - HMAC sequences: `HMAC_Start`, `SequenceUpdate`, `SequenceComplete`
//! - Random: `GetRandom`
//! - Sessions: Policy sessions for PCR-based authorization
//! - Capability: transient-handle enumeration
//!
//! ## Example
//!
//! ```no_run
//! use tpm2::TpmContext;
//!
//! let mut ctx = TpmContext::new(None)?; // Auto-detect TPM device
//! let random_bytes = ctx.get_random(32)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod buf;
mod commands;
mod constants;
mod device;
mod frame;
pub mod rc;
mod session;
mod types;

pub use commands::TpmContext;
pub use constants::*;
pub use types::*;

// Re-export the framing layer for advanced usage
pub use buf::{Marshal, ReadBuf, Unmarshal, WriteBuf};
pub use device::TpmDevice;
pub use frame::{CommandFrame, Reply};
pub use session::AuthSession;
