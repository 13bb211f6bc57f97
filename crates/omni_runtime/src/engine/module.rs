use anyhow::{Context as _, Result};
use sha2::{Digest, Sha256};

use super::metadata::{self, ModuleMetadata};

pub struct WasmModule {
    pub(crate) wasm: Vec<u8>,
    pub(crate) metadata: ModuleMetadata,
    sha256: [u8; 32],
}

impl WasmModule {
    /// Create a new `WasmModule` from a WASM binary or WAT text.
    pub fn new(wasm: Vec<u8>) -> Result<Self> {
        let wasm = wat::parse_bytes(&wasm)
            .context("failed to parse module")?
            .into_owned();
        let metadata = metadata::go(&wasm)?;
        let sha256 = Sha256::digest(&wasm).into();
        Ok(Self {
            wasm,
            metadata,
            sha256,
        })
    }

    pub fn metadata(&self) -> &ModuleMetadata {
        &self.metadata
    }

    /// Lowercase hex SHA-256 of the binary, for logging which build ran.
    pub fn digest(&self) -> String {
        self.sha256.iter().map(|b| format!("{b:02x}")).collect()
    }
}
