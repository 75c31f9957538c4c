// ABOUTME: Canonical schema definitions and fingerprinting
// ABOUTME: Both ends derive the schema version by hashing the schema text

use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// A named canonical schema: additive DDL applied to every replica of a
/// room. The version exchanged on the wire is derived from the text, so
/// client and server agree on schema identity iff their texts match.
#[derive(Debug, Clone)]
pub struct SchemaDef {
    pub name: String,
    pub text: String,
}

impl SchemaDef {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    /// Load a schema from a `.sql` file; the file stem becomes the schema
    /// name.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read schema file {}", path.display()))?;
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| anyhow::anyhow!("schema path {} has no file stem", path.display()))?
            .to_string();
        Ok(Self { name, text })
    }

    pub fn fingerprint(&self) -> u32 {
        fingerprint(&self.text)
    }
}

/// Version integer derived from hashing the canonical schema text.
/// Leading/trailing whitespace is not significant.
pub fn fingerprint(text: &str) -> u32 {
    let digest = Sha256::digest(text.trim().as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}
