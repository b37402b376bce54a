//! The static key file format.
//!
//! ```text
//! #
//! # 2048 bit OpenVPN static key
//! #
//! -----BEGIN OpenVPN Static key V1-----
//! 16 lines of 32 hex digits
//! -----END OpenVPN Static key V1-----
//! ```

use std::fmt::Write;
use std::path::Path;

use crate::crypto::Key2;
use crate::{Error, SeededRng};

const BEGIN: &str = "-----BEGIN OpenVPN Static key V1-----";
const END: &str = "-----END OpenVPN Static key V1-----";

/// A [`Key2`] read from or written to a static key file.
#[derive(Debug, Clone)]
pub struct KeyFile {
    key: Key2,
}

impl KeyFile {
    pub fn new(key: Key2) -> Self {
        KeyFile { key }
    }

    /// Fresh random key.
    pub fn generate(rng: &mut SeededRng) -> Self {
        KeyFile {
            key: Key2::random(rng),
        }
    }

    pub fn key(&self) -> &Key2 {
        &self.key
    }

    pub fn into_key(self) -> Key2 {
        self.key
    }

    /// Parse the text of a key file. Anything outside the markers is
    /// ignored.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut inside = false;
        let mut seen_end = false;
        let mut hex_digits = String::with_capacity(Key2::LEN * 2);

        for line in text.lines() {
            let line = line.trim();
            if line == BEGIN {
                inside = true;
                continue;
            }
            if line == END {
                seen_end = inside;
                break;
            }
            if inside && !line.starts_with('#') {
                hex_digits.extend(line.chars().filter(|c| !c.is_whitespace()));
            }
        }

        if !seen_end {
            return Err(Error::KeyFileError("Missing key file markers".into()));
        }

        let block = hex::decode(&hex_digits)
            .map_err(|e| Error::KeyFileError(format!("Bad hex: {}", e)))?;
        if block.len() != Key2::LEN {
            return Err(Error::KeyFileError(format!(
                "Expected {} key bytes, found {}",
                Key2::LEN,
                block.len()
            )));
        }
        Ok(KeyFile {
            key: Key2::from_block(&block)?,
        })
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Render in the file format.
    pub fn to_file_string(&self) -> String {
        let block = self.key.to_block();
        let mut out = String::new();
        out.push_str("#\n# 2048 bit OpenVPN static key\n#\n");
        out.push_str(BEGIN);
        out.push('\n');
        for chunk in block.chunks(16) {
            let _ = writeln!(out, "{}", hex::encode(chunk));
        }
        out.push_str(END);
        out.push('\n');
        out
    }
}
