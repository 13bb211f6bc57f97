use std::collections::HashMap;

use anyhow::Result;
use wasmparser::{ExternalKind, Parser, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Func,
    Table,
    Memory,
    Global,
    Tag,
    Other,
}

impl From<ExternalKind> for ExportKind {
    fn from(kind: ExternalKind) -> Self {
        match kind {
            ExternalKind::Func => Self::Func,
            ExternalKind::Table => Self::Table,
            ExternalKind::Memory => Self::Memory,
            ExternalKind::Global => Self::Global,
            ExternalKind::Tag => Self::Tag,
            #[allow(unreachable_patterns)]
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModuleMetadata {
    pub exports: HashMap<String, ExportKind>,
}

impl ModuleMetadata {
    pub fn exports_function(&self, name: &str) -> bool {
        self.exports.get(name) == Some(&ExportKind::Func)
    }
}

/// Precondition: data is a binary of the WASM module.
pub(crate) fn go(data: &[u8]) -> Result<ModuleMetadata> {
    let mut metadata = ModuleMetadata::default();
    for payload in Parser::new(0).parse_all(data) {
        match payload? {
            Payload::ExportSection(section) => {
                for export in section {
                    let export = export?;
                    metadata
                        .exports
                        .insert(export.name.to_string(), export.kind.into());
                }
            }
            Payload::End(_) => {
                break;
            }
            _ => {}
        }
    }
    tracing::debug!("found {} exports", metadata.exports.len());
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_exports() {
        let wasm = wat::parse_str(
            r#"(module
                (import "env" "print" (func (param i32)))
                (import "env" "memory" (memory 1 1 shared))
                (import "wasi_snapshot_preview1" "proc_exit" (func (param i32)))
                (func (export "_start"))
                (global (export "g") i32 (i32.const 0)))"#,
        )
        .unwrap();
        let metadata = go(&wasm).unwrap();
        assert!(metadata.exports_function("_start"));
        assert!(!metadata.exports_function("g"));
        assert!(!metadata.exports_function("main"));
        assert_eq!(metadata.exports.get("g"), Some(&ExportKind::Global));
        assert_eq!(metadata.exports.len(), 2);
    }

    #[test]
    fn rejects_garbage() {
        assert!(go(b"\0asm\x01\0\0\0\x07\xff").is_err());
    }
}
