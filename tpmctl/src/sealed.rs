// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Sealed-blob codec
//!
//! Seal output travels as a `SealedBytes` protobuf message wrapped in
//! unpadded standard base64. The message records the PCR selection the seal
//! policy was computed over, so the consumer can rebuild the policy without
//! out-of-band knowledge. Enum values are TPM algorithm identifiers.

use anyhow::{bail, Context as _, Result};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use prost::Message;
use tpm2::{TpmAlgId, TpmlPcrSelection};

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum HashAlgo {
    Invalid = 0x0000,
    Sha1 = 0x0004,
    Sha256 = 0x000B,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ObjectType {
    Invalid = 0x0000,
    Rsa = 0x0001,
    Ecc = 0x0023,
}

/// Serialized TPM2_Create output bound to a PCR policy
#[derive(Clone, PartialEq, prost::Message)]
pub struct SealedBytes {
    #[prost(bytes = "vec", tag = "1")]
    pub priv_area: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub pub_area: Vec<u8>,
    #[prost(int32, repeated, tag = "3")]
    pub pcrs: Vec<i32>,
    #[prost(enumeration = "HashAlgo", tag = "4")]
    pub hash: i32,
    #[prost(enumeration = "ObjectType", tag = "5")]
    pub srk: i32,
}

/// A decoded sealed blob
#[derive(Debug)]
pub struct Sealed {
    pub public: Vec<u8>,
    pub private: Vec<u8>,
    pub pcrs: Vec<u32>,
}

impl Sealed {
    /// The PCR selection the seal policy covers
    pub fn selection(&self) -> TpmlPcrSelection {
        TpmlPcrSelection::single(TpmAlgId::Sha256, &self.pcrs)
    }
}

/// Encode seal output as unpadded standard base64
pub fn encode(public: &[u8], private: &[u8], pcrs: &[u32]) -> String {
    let msg = SealedBytes {
        priv_area: private.to_vec(),
        pub_area: public.to_vec(),
        pcrs: pcrs.iter().map(|&p| p as i32).collect(),
        hash: HashAlgo::Sha256 as i32,
        srk: ObjectType::Rsa as i32,
    };
    STANDARD_NO_PAD.encode(msg.encode_to_vec())
}

/// Decode a sealed blob, validating the hash algorithm
pub fn decode(encoded: &str) -> Result<Sealed> {
    let raw = STANDARD_NO_PAD
        .decode(encoded)
        .context("sealed blob is not valid base64")?;
    let msg = SealedBytes::decode(raw.as_slice()).context("sealed blob does not parse")?;

    if msg.hash != HashAlgo::Sha256 as i32 {
        bail!("sealed blob uses unsupported hash algorithm {}", msg.hash);
    }

    Ok(Sealed {
        public: msg.pub_area,
        private: msg.priv_area,
        pcrs: msg.pcrs.iter().map(|&p| p as u32).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let pcrs: Vec<u32> = vec![0, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
        let encoded = encode(b"public-bytes", b"private-bytes", &pcrs);

        let sealed = decode(&encoded).unwrap();
        assert_eq!(sealed.public, b"public-bytes");
        assert_eq!(sealed.private, b"private-bytes");
        assert_eq!(sealed.pcrs, pcrs);
    }

    #[test]
    fn test_no_padding() {
        // Vary the payload size so every base64 phase is hit
        for n in 0..4 {
            let encoded = encode(&vec![0xA5; 10 + n], b"p", &[0]);
            assert!(!encoded.contains('='));
        }
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(decode("not base64 at all!").is_err());
        // Valid base64 that is not a SealedBytes message
        let bogus = STANDARD_NO_PAD.encode([0xFFu8; 16]);
        assert!(decode(&bogus).is_err());
    }

    #[test]
    fn test_rejects_wrong_hash() {
        let msg = SealedBytes {
            priv_area: b"p".to_vec(),
            pub_area: b"q".to_vec(),
            pcrs: vec![0],
            hash: HashAlgo::Sha1 as i32,
            srk: ObjectType::Rsa as i32,
        };
        let encoded = STANDARD_NO_PAD.encode(msg.encode_to_vec());
        let err = decode(&encoded).unwrap_err();
        assert!(err.to_string().contains("unsupported hash"));
    }

    #[test]
    fn test_selection_covers_recorded_pcrs() {
        let sealed = Sealed {
            public: Vec::new(),
            private: Vec::new(),
            pcrs: vec![0, 2, 15],
        };
        let selection = sealed.selection();
        assert_eq!(selection.pcr_selections.len(), 1);
        assert_eq!(selection.pcr_selections[0].selected(), vec![0, 2, 15]);
    }
}
