//! Fuzz target for the chunked AEAD stream
//!
//! - Decrypting arbitrary bytes must fail cleanly, never panic
//! - Clean round trips must preserve content
//! - Any single flipped byte must be rejected

#![no_main]

use std::io::{Read, Write};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use oxbucket_core::crypto::{AeadStreamReader, AeadStreamWriter};

const KEY: [u8; 32] = [0x42; 32];

#[derive(Arbitrary, Debug)]
enum FuzzMode {
    /// Decrypt raw bytes
    DecryptRaw,
    /// Encrypt, then check the round trip
    Roundtrip,
    /// Encrypt, flip one byte, then decrypt
    RoundtripCorrupt { position: usize, mask: u8 },
    /// Encrypt, truncate, then decrypt
    RoundtripTruncate { cut: usize },
}

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    mode: FuzzMode,
    data: Vec<u8>,
    /// Write in pieces of this size to exercise chunk buffering
    write_size: u16,
}

fn encrypt(data: &[u8], write_size: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut writer = AeadStreamWriter::new(&mut out, &KEY).expect("valid key");
    for piece in data.chunks(write_size.max(1)) {
        writer.write_all(piece).expect("write to Vec");
    }
    writer.finish().expect("finish to Vec");
    drop(writer);
    out
}

fn decrypt(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut reader = AeadStreamReader::new(data, &KEY).expect("valid key");
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}

fuzz_target!(|input: FuzzInput| {
    if input.data.len() > 1024 * 1024 {
        return;
    }

    match input.mode {
        FuzzMode::DecryptRaw => {
            let _ = decrypt(&input.data);
        }

        FuzzMode::Roundtrip => {
            let encrypted = encrypt(&input.data, usize::from(input.write_size));
            let decrypted = decrypt(&encrypted).expect("clean round trip must succeed");
            assert_eq!(decrypted, input.data, "round trip must preserve content");
        }

        FuzzMode::RoundtripCorrupt { position, mask } => {
            if mask == 0 {
                return;
            }
            let mut encrypted = encrypt(&input.data, usize::from(input.write_size));
            let pos = position % encrypted.len();
            encrypted[pos] ^= mask;
            assert!(decrypt(&encrypted).is_err(), "corruption at {pos} went undetected");
        }

        FuzzMode::RoundtripTruncate { cut } => {
            let encrypted = encrypt(&input.data, usize::from(input.write_size));
            let cut = cut % encrypted.len();
            assert!(decrypt(&encrypted[..cut]).is_err(), "truncation at {cut} went undetected");
        }
    }
});
