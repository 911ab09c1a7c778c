// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM command framing
//!
//! A command is a 10-byte header (tag, total size, command code) followed by
//! the handle area, an optional authorization area prefixed by its own
//! 32-bit size, and the command parameters. The reply mirrors the header;
//! everything after it is response handles plus parameters.

use anyhow::{bail, Result};

use super::buf::{Marshal, ReadBuf, WriteBuf};
use super::constants::*;
use super::rc::decode_rc;

/// TPM command builder
pub struct CommandFrame {
    buf: WriteBuf,
}

impl CommandFrame {
    /// Create a new command without sessions
    pub fn new(command_code: TpmCc) -> Self {
        Self::with_tag(TpmSt::NoSessions, command_code)
    }

    /// Create a new command with sessions
    pub fn with_sessions(command_code: TpmCc) -> Self {
        Self::with_tag(TpmSt::Sessions, command_code)
    }

    fn with_tag(tag: TpmSt, command_code: TpmCc) -> Self {
        let mut buf = WriteBuf::with_capacity(256);

        // Header: tag (2) + size (4) + command code (4)
        buf.put_u16(tag.to_u16());
        buf.put_u32(0); // Size placeholder
        buf.put_u32(command_code.to_u32());

        Self { buf }
    }

    /// Add a handle to the command
    pub fn add_handle(&mut self, handle: u32) {
        self.buf.put_u32(handle);
    }

    /// Add raw bytes to the command
    pub fn add_bytes(&mut self, data: &[u8]) {
        self.buf.put_bytes(data);
    }

    /// Add a u8 value
    pub fn add_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Add a u16 value
    pub fn add_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    /// Add a u32 value
    pub fn add_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    /// Add a TPM2B structure
    pub fn add_tpm2b(&mut self, data: &[u8]) {
        self.buf.put_tpm2b(data);
    }

    /// Add an empty TPM2B structure
    pub fn add_tpm2b_empty(&mut self) {
        self.buf.put_tpm2b_empty();
    }

    /// Add a marshallable structure
    pub fn add<T: Marshal>(&mut self, value: &T) {
        value.marshal(&mut self.buf);
    }

    /// Add a password authorization session carrying the given auth value
    pub fn add_password_auth(&mut self, auth: &[u8]) {
        // Authorization area size (4 bytes), then one session:
        // handle (4) + nonce (2) + attributes (1) + auth 2B (2 + len)
        let auth_size = (4 + 2 + 1 + 2 + auth.len()) as u32;

        self.buf.put_u32(auth_size);
        self.buf.put_u32(tpm_rh::PW); // Password session handle
        self.buf.put_u16(0); // Empty nonce
        self.buf.put_u8(TpmaSa::CONTINUE_SESSION);
        self.buf.put_tpm2b(auth);
    }

    /// Add a password authorization session with an empty auth value
    pub fn add_null_auth_area(&mut self) {
        self.add_password_auth(&[]);
    }

    /// Add a policy session authorization
    pub fn add_policy_auth(&mut self, session_handle: u32) {
        let auth_size: u32 = 4 + 2 + 1 + 2;

        self.buf.put_u32(auth_size);
        self.buf.put_u32(session_handle);
        self.buf.put_u16(0); // Empty nonce
        self.buf.put_u8(TpmaSa::CONTINUE_SESSION);
        self.buf.put_u16(0); // Empty auth value
    }

    /// Finalize the command and return the bytes
    pub fn finalize(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf.patch_u32(2, size);
        self.buf.into_vec()
    }
}

/// TPM response header plus parameter bytes
#[derive(Debug)]
pub struct Reply {
    pub tag: TpmSt,
    pub code: u32,
    pub data: Vec<u8>,
}

impl Reply {
    /// Parse a TPM response
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < 10 {
            bail!("TPM response too short: {} bytes", response.len());
        }

        let mut buf = ReadBuf::new(response);

        let tag_raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(tag_raw)
            .ok_or_else(|| anyhow::anyhow!("invalid response tag: 0x{:04x}", tag_raw))?;

        let size = buf.get_u32()? as usize;
        if response.len() < size {
            bail!(
                "TPM response size mismatch: expected {}, got {}",
                size,
                response.len()
            );
        }

        let code = buf.get_u32()?;
        let data = response[10..size].to_vec();

        Ok(Self { tag, code, data })
    }

    /// Check if the response indicates success
    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// Classify the response code, erroring on anything but success
    pub fn ensure_success(&self) -> Result<()> {
        decode_rc(self.code)?;
        Ok(())
    }

    /// Get a buffer over the response body (handles first, then parameters)
    pub fn data_buffer(&self) -> ReadBuf<'_> {
        ReadBuf::new(&self.data)
    }

    /// Skip the parameter size field (for commands with sessions)
    pub fn skip_parameter_size(&self) -> Result<ReadBuf<'_>> {
        let mut buf = self.data_buffer();
        if self.tag == TpmSt::Sessions {
            let _param_size = buf.get_u32()?;
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_random_frame() {
        let mut cmd = CommandFrame::new(TpmCc::GetRandom);
        cmd.add_u16(32); // Request 32 random bytes

        let bytes = cmd.finalize();

        assert_eq!(&bytes[0..2], &[0x80, 0x01]); // TPM_ST_NO_SESSIONS
        assert_eq!(&bytes[6..10], &[0x00, 0x00, 0x01, 0x7B]); // TPM_CC_GetRandom

        let size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        assert_eq!(size as usize, bytes.len());
    }

    #[test]
    fn test_hmac_start_frame() {
        // HMAC_Start for key 0x80000001, empty sequence auth, SHA-256.
        // The sequence auth appears both in the authorization area and as a
        // length-prefixed parameter.
        let mut cmd = CommandFrame::with_sessions(TpmCc::HmacStart);
        cmd.add_handle(0x80000001);
        cmd.add_password_auth(b"");
        cmd.add_tpm2b(b"");
        cmd.add_u16(TpmAlgId::Sha256.to_u16());

        let expected = [
            0x80, 0x02, // TPM_ST_SESSIONS
            0x00, 0x00, 0x00, 0x1F, // size = 31
            0x00, 0x00, 0x01, 0x5B, // TPM_CC_HMAC_Start
            0x80, 0x00, 0x00, 0x01, // key handle
            0x00, 0x00, 0x00, 0x09, // auth area size
            0x40, 0x00, 0x00, 0x09, // TPM_RS_PW
            0x00, 0x00, // empty nonce
            0x01, // continueSession
            0x00, 0x00, // empty auth value
            0x00, 0x00, // sequence auth parameter (empty)
            0x00, 0x0B, // TPM_ALG_SHA256
        ];
        assert_eq!(cmd.finalize(), expected);
    }

    #[test]
    fn test_password_auth_with_value() {
        let mut cmd = CommandFrame::with_sessions(TpmCc::SequenceUpdate);
        cmd.add_handle(0x80000002);
        cmd.add_password_auth(b"pass");

        let bytes = cmd.finalize();
        // auth area size = 9 + 4 auth bytes
        assert_eq!(&bytes[14..18], &[0x00, 0x00, 0x00, 0x0D]);
        assert_eq!(&bytes[25..27], &[0x00, 0x04]);
        assert_eq!(&bytes[27..31], b"pass");
    }

    #[test]
    fn test_reply_parse() {
        // Minimal success response
        let response = vec![
            0x80, 0x01, // TPM_ST_NO_SESSIONS
            0x00, 0x00, 0x00, 0x0A, // Size = 10
            0x00, 0x00, 0x00, 0x00, // TPM_RC_SUCCESS
        ];

        let parsed = Reply::parse(&response).unwrap();
        assert!(parsed.is_success());
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn test_reply_error_classification() {
        // TPM_RC_AUTH_FAIL for session 1
        let response = vec![
            0x80, 0x01, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x09, 0x8E,
        ];

        let parsed = Reply::parse(&response).unwrap();
        assert!(!parsed.is_success());
        let err = parsed.ensure_success().unwrap_err();
        assert!(err.to_string().contains("session 1"));
    }
}
