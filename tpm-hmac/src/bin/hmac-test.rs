// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! HMAC custody test CLI
//!
//! Exercises the import / sequence / reload paths against real TPM
//! hardware and compares every digest with a software HMAC-SHA256
//! reference.
//!
//! Usage:
//!   hmac-test [command]
//!
//! Commands:
//!   vector      - Fixed test vector HMAC("hello", "abc")
//!   chunks      - Inputs straddling the 1024-byte chunk boundary
//!   reload      - Context blob save/reload produces identical digests
//!   hygiene     - Transient handle count is unchanged by import + hmac
//!   all         - Run all tests

use std::env;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tpm_hmac::{import_key, Hmacer};
use tpm2::TpmContext;

const VECTOR_DIGEST: &str = "9c38b1c63a228f3ccca5d1acee06d8ca35d63050ab33c5bb9a42a20c0b05b95c";

fn main() {
    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("all");

    println!("=== TPM HMAC Custody Test Tool ===\n");

    match command {
        "vector" => test_vector(),
        "chunks" => test_chunks(),
        "reload" => test_reload(),
        "hygiene" => test_hygiene(),
        "all" => {
            test_vector();
            test_chunks();
            test_reload();
            test_hygiene();
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            eprintln!("Available commands: vector, chunks, reload, hygiene, all");
            std::process::exit(1);
        }
    }
}

fn open_tpm() -> Option<TpmContext> {
    match TpmContext::new(None) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            println!("✗ Failed to open TPM: {}", e);
            None
        }
    }
}

fn software_hmac(secret: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn test_vector() {
    println!("--- Test: Fixed Vector ---");

    let Some(mut ctx) = open_tpm() else { return };

    let blob = match import_key(&mut ctx, b"hello") {
        Ok(blob) => {
            println!("✓ Imported secret \"hello\" ({} char blob)", blob.len());
            blob
        }
        Err(e) => {
            println!("✗ Import failed: {}", e);
            return;
        }
    };

    let mut hmacer = match Hmacer::load(ctx, &blob) {
        Ok(h) => h,
        Err(e) => {
            println!("✗ Blob reload failed: {}", e);
            return;
        }
    };

    match hmacer.hmac(b"abc") {
        Ok(digest) => {
            let hex_digest = hex::encode(digest);
            if hex_digest == VECTOR_DIGEST && digest == software_hmac(b"hello", b"abc") {
                println!("✓ Digest matches the fixed vector");
            } else {
                println!("✗ Digest mismatch!");
                println!("  Expected: {}", VECTOR_DIGEST);
                println!("  Got:      {}", hex_digest);
            }
        }
        Err(e) => {
            println!("✗ Hmac failed: {}", e);
        }
    }
    println!();
}

fn test_chunks() {
    println!("--- Test: Chunk Boundaries ---");

    let Some(mut ctx) = open_tpm() else { return };

    let secret = match ctx.get_random(64) {
        Ok(s) => s,
        Err(e) => {
            println!("✗ GetRandom failed: {}", e);
            return;
        }
    };

    let blob = match import_key(&mut ctx, &secret) {
        Ok(blob) => blob,
        Err(e) => {
            println!("✗ Import failed: {}", e);
            return;
        }
    };
    println!("✓ Imported 64 byte random secret");

    let mut hmacer = match Hmacer::load(ctx, &blob) {
        Ok(h) => h,
        Err(e) => {
            println!("✗ Blob reload failed: {}", e);
            return;
        }
    };

    // Lengths around the 1024-byte sequence chunk size, plus a zero-filled
    // body of 2049 bytes
    for len in [1usize, 1023, 1024, 1025, 2047, 2048, 2049] {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        match hmacer.hmac(&data) {
            Ok(digest) => {
                if digest == software_hmac(&secret, &data) {
                    println!("✓ {} bytes: matches software reference", len);
                } else {
                    println!("✗ {} bytes: digest mismatch!", len);
                }
            }
            Err(e) => {
                println!("✗ {} bytes: hmac failed: {}", len, e);
            }
        }
    }

    let zeros = vec![0u8; 2049];
    match hmacer.hmac(&zeros) {
        Ok(digest) => {
            if digest == software_hmac(&secret, &zeros) {
                println!("✓ 2049 zero bytes: matches software reference");
            } else {
                println!("✗ 2049 zero bytes: digest mismatch!");
            }
        }
        Err(e) => {
            println!("✗ 2049 zero bytes: hmac failed: {}", e);
        }
    }
    println!();
}

fn test_reload() {
    println!("--- Test: Context Blob Reload ---");

    let Some(mut ctx) = open_tpm() else { return };

    let blob = match import_key(&mut ctx, b"reload-secret") {
        Ok(blob) => blob,
        Err(e) => {
            println!("✗ Import failed: {}", e);
            return;
        }
    };

    let first = {
        let mut hmacer = match Hmacer::load(ctx, &blob) {
            Ok(h) => h,
            Err(e) => {
                println!("✗ First load failed: {}", e);
                return;
            }
        };
        match hmacer.hmac(b"stable input") {
            Ok(digest) => digest,
            Err(e) => {
                println!("✗ First hmac failed: {}", e);
                return;
            }
        }
        // hmacer dropped here, flushing its handle
    };

    let Some(ctx) = open_tpm() else { return };
    let mut hmacer = match Hmacer::load(ctx, &blob) {
        Ok(h) => h,
        Err(e) => {
            println!("✗ Reload failed: {}", e);
            return;
        }
    };
    match hmacer.hmac(b"stable input") {
        Ok(second) => {
            if first == second {
                println!("✓ Reloaded blob produces the same digest");
            } else {
                println!("✗ Digest changed after reload!");
            }
        }
        Err(e) => {
            println!("✗ Second hmac failed: {}", e);
        }
    }

    // A corrupt blob must be rejected at load time
    let Some(ctx) = open_tpm() else { return };
    match Hmacer::load(ctx, "zz-not-hex") {
        Ok(_) => println!("✗ Malformed hex blob unexpectedly loaded!"),
        Err(_) => println!("✓ Malformed hex blob rejected"),
    }
    println!();
}

fn test_hygiene() {
    println!("--- Test: Transient Handle Hygiene ---");

    let Some(mut ctx) = open_tpm() else { return };

    let before = match ctx.transient_handles() {
        Ok(handles) => handles.len(),
        Err(e) => {
            println!("✗ GetCapability failed: {}", e);
            return;
        }
    };
    println!("  {} transient handles loaded before", before);

    let blob = match import_key(&mut ctx, b"hygiene-secret") {
        Ok(blob) => blob,
        Err(e) => {
            println!("✗ Import failed: {}", e);
            return;
        }
    };

    match ctx.transient_handles() {
        Ok(handles) => {
            if handles.len() == before {
                println!("✓ Import left no transient handles behind");
            } else {
                println!(
                    "✗ Import changed transient handle count: {} -> {}",
                    before,
                    handles.len()
                );
            }
        }
        Err(e) => println!("✗ GetCapability failed: {}", e),
    }

    {
        let mut hmacer = match Hmacer::load(ctx, &blob) {
            Ok(h) => h,
            Err(e) => {
                println!("✗ Blob load failed: {}", e);
                return;
            }
        };
        if let Err(e) = hmacer.hmac(b"hygiene input") {
            println!("✗ Hmac failed: {}", e);
        }
        match hmacer.context_mut().transient_handles() {
            // The loaded key itself is the one expected handle
            Ok(handles) => {
                if handles.len() == before + 1 {
                    println!("✓ Exactly one key handle loaded while serving");
                } else {
                    println!(
                        "✗ Unexpected transient handle count while serving: {}",
                        handles.len()
                    );
                }
            }
            Err(e) => println!("✗ GetCapability failed: {}", e),
        }
        // hmacer dropped here, flushing the key handle
    }

    let Some(mut ctx) = open_tpm() else { return };
    match ctx.transient_handles() {
        Ok(handles) => {
            if handles.len() == before {
                println!("✓ Key handle flushed on drop");
            } else {
                println!(
                    "✗ Transient handles leaked: {} -> {}",
                    before,
                    handles.len()
                );
            }
        }
        Err(e) => println!("✗ GetCapability failed: {}", e),
    }
    println!();
}
