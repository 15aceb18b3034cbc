//! Patch definitions supplied by configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::error::{Error, Result};
use crate::image::constants::{CPU_TYPE_ARM64, CPU_TYPE_X86_64};

/// Concrete architecture a patch matches and applies against. Patches are
/// never translated across architectures.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
    IntoStaticStr,
)]
pub enum Architecture {
    #[serde(rename = "x86_64")]
    #[strum(serialize = "x86_64")]
    X86_64,
    #[serde(rename = "arm64")]
    #[strum(serialize = "arm64")]
    Arm64,
}

impl Architecture {
    pub fn cpu_type(self) -> u32 {
        match self {
            Self::X86_64 => CPU_TYPE_X86_64,
            Self::Arm64 => CPU_TYPE_ARM64,
        }
    }
}

/// The fixed enumeration of patchable (segment, section) pairs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SegmentClass {
    Text,
    TextConst,
    TextCstring,
    TextUstring,
    DataConst,
    DataCfstring,
    DataCommon,
}

impl SegmentClass {
    pub fn segment_name(self) -> &'static str {
        match self {
            Self::Text | Self::TextConst | Self::TextCstring | Self::TextUstring => "__TEXT",
            Self::DataConst | Self::DataCfstring | Self::DataCommon => "__DATA",
        }
    }

    pub fn section_name(self) -> &'static str {
        match self {
            Self::Text => "__text",
            Self::TextConst | Self::DataConst => "__const",
            Self::TextCstring => "__cstring",
            Self::TextUstring => "__ustring",
            Self::DataCfstring => "__cfstring",
            Self::DataCommon => "__common",
        }
    }

    /// Text-like classes retarget against the module's text mapping in a
    /// shared region; data-like classes against its data mapping.
    pub fn is_text(self) -> bool {
        matches!(
            self,
            Self::Text | Self::TextConst | Self::TextCstring | Self::TextUstring
        )
    }

    pub fn is_data(self) -> bool {
        !self.is_text()
    }
}

/// One declarative byte-pattern edit. `find` and `replace` are hex byte
/// strings of equal length; the shared length is the single patch size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchSpec {
    pub arch: Architecture,
    pub segment: SegmentClass,
    pub find: String,
    pub replace: String,
    /// Leading matches to ignore
    #[serde(default)]
    pub skip: usize,
    /// Maximum matches to record after skipping
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    1
}

impl PatchSpec {
    pub fn find_bytes(&self) -> Result<Vec<u8>> {
        parse_bytes(&self.find)
    }

    pub fn replace_bytes(&self) -> Result<Vec<u8>> {
        parse_bytes(&self.replace)
    }
}

/// One binary module on disk together with its patches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub path: String,
    pub patches: Vec<PatchSpec>,
}

/// A process image the engine intercepts at exec time. Matching is by
/// exact path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub path: String,
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchSet {
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
    #[serde(default)]
    pub processes: Vec<ProcessSpec>,
}

pub fn load_patch_set<P: AsRef<Path>>(path: P) -> Result<PatchSet> {
    let content = fs::read_to_string(&path)?;
    let set = serde_json::from_str(&content)?;
    Ok(set)
}

pub fn save_patch_set<P: AsRef<Path>>(path: P, set: &PatchSet) -> Result<()> {
    let content = serde_json::to_string_pretty(set)?;
    fs::write(path, content)?;
    Ok(())
}

/// Parse a "DE AD BE EF" hex byte string.
pub fn parse_bytes(pattern: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for token in pattern.split_whitespace() {
        let value = u8::from_str_radix(token, 16)
            .map_err(|e| Error::InvalidPatch(format!("invalid byte token '{token}': {e}")))?;
        bytes.push(value);
    }

    if bytes.is_empty() {
        return Err(Error::InvalidPatch("byte pattern is empty".to_string()));
    }

    Ok(bytes)
}

pub fn format_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bytes() {
        let bytes = parse_bytes("48 8D 0D FF").unwrap();
        assert_eq!(bytes, vec![0x48, 0x8D, 0x0D, 0xFF]);
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("ZZ").is_err());
    }

    #[test]
    fn test_format_bytes_roundtrip() {
        let bytes = vec![0x48, 0x8D, 0x0D, 0x00, 0xFF];
        let formatted = format_bytes(&bytes);
        assert_eq!(formatted, "48 8D 0D 00 FF");
        assert_eq!(parse_bytes(&formatted).unwrap(), bytes);
    }

    #[test]
    fn test_segment_class_names() {
        assert_eq!(SegmentClass::Text.segment_name(), "__TEXT");
        assert_eq!(SegmentClass::Text.section_name(), "__text");
        assert_eq!(SegmentClass::DataCfstring.segment_name(), "__DATA");
        assert_eq!(SegmentClass::DataCfstring.section_name(), "__cfstring");
        assert!(SegmentClass::TextConst.is_text());
        assert!(SegmentClass::DataCommon.is_data());
    }

    #[test]
    fn test_patch_set_save_and_load() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let set = PatchSet {
            modules: vec![ModuleSpec {
                path: "/usr/lib/libsample.dylib".to_string(),
                patches: vec![PatchSpec {
                    arch: Architecture::X86_64,
                    segment: SegmentClass::Text,
                    find: "74 02".to_string(),
                    replace: "EB 02".to_string(),
                    skip: 0,
                    count: 1,
                }],
            }],
            processes: vec![ProcessSpec {
                path: "/usr/bin/sample".to_string(),
            }],
        };

        save_patch_set(file.path(), &set).unwrap();
        let loaded = load_patch_set(file.path()).unwrap();
        assert_eq!(loaded.modules.len(), 1);
        assert_eq!(loaded.modules[0].patches[0].count, 1);
        assert_eq!(loaded.processes[0].path, "/usr/bin/sample");
    }

    #[test]
    fn test_patch_spec_defaults_from_json() {
        let json = r#"{
            "arch": "x86_64",
            "segment": "text",
            "find": "90 90",
            "replace": "CC CC"
        }"#;
        let spec: PatchSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.skip, 0);
        assert_eq!(spec.count, 1);
        assert_eq!(spec.arch, Architecture::X86_64);
        assert_eq!(spec.segment, SegmentClass::Text);
    }
}
