//! Version tag extraction from compiled XDP objects.
//!
//! The tag lives in the `xdp_metadata` section under the
//! `XSK_PROG_VERSION` symbol, so tooling can read it without loading or
//! running anything.

use std::fs;
use std::path::Path;

use object::{Object, ObjectSection, ObjectSymbol};
use xskd_ebpf_common::{symbols, METADATA_SECTION, XSK_PROG_VERSION};

use crate::error::{Result, XskError};

/// Read the version tag from raw ELF bytes.
pub fn read_object_version(bytes: &[u8]) -> Result<u32> {
    let file = object::File::parse(bytes).map_err(|e| XskError::Metadata(e.to_string()))?;

    let section = file.section_by_name(METADATA_SECTION).ok_or_else(|| {
        XskError::Metadata(format!("section '{}' not found", METADATA_SECTION))
    })?;

    let symbol = file
        .symbols()
        .find(|s| s.name().ok() == Some(symbols::XSK_PROG_VERSION))
        .ok_or_else(|| {
            XskError::Metadata(format!("symbol '{}' not found", symbols::XSK_PROG_VERSION))
        })?;

    if symbol.section_index() != Some(section.index()) {
        return Err(XskError::Metadata(format!(
            "symbol '{}' is not in section '{}'",
            symbols::XSK_PROG_VERSION,
            METADATA_SECTION
        )));
    }

    let data = section
        .data()
        .map_err(|e| XskError::Metadata(e.to_string()))?;
    let offset = symbol
        .address()
        .checked_sub(section.address())
        .ok_or_else(|| XskError::Metadata("symbol precedes its section".into()))?;

    // Symbol values come straight from the file and may point anywhere
    let raw: [u8; 4] = usize::try_from(offset)
        .ok()
        .and_then(|start| Some(start..start.checked_add(4)?))
        .and_then(|range| data.get(range))
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| XskError::Metadata("version tag truncated".into()))?;

    Ok(if file.is_little_endian() {
        u32::from_le_bytes(raw)
    } else {
        u32::from_be_bytes(raw)
    })
}

/// Read the version tag from an object file on disk.
pub fn read_file_version(path: impl AsRef<Path>) -> Result<u32> {
    read_object_version(&fs::read(path)?)
}

/// Fail unless `bytes` carries the version this control plane was built for.
pub fn ensure_compatible(bytes: &[u8]) -> Result<()> {
    let found = read_object_version(bytes)?;
    if found != XSK_PROG_VERSION {
        return Err(XskError::VersionMismatch {
            expected: XSK_PROG_VERSION,
            found,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::write::{Object as WriteObject, Symbol, SymbolSection};
    use object::{
        Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind,
        SymbolScope,
    };

    /// Build a minimal BPF ELF carrying `version` at a non-zero offset.
    fn artifact(section_name: &str, symbol_name: &str, version: u32, endian: Endianness) -> Vec<u8> {
        artifact_at(section_name, symbol_name, version, endian, None)
    }

    /// Same as [`artifact`], with the symbol value optionally forced.
    fn artifact_at(
        section_name: &str,
        symbol_name: &str,
        version: u32,
        endian: Endianness,
        symbol_value: Option<u64>,
    ) -> Vec<u8> {
        let mut obj = WriteObject::new(BinaryFormat::Elf, Architecture::Bpf, endian);
        let section = obj.add_section(Vec::new(), section_name.as_bytes().to_vec(), SectionKind::Data);

        obj.append_section_data(section, &[0xAA; 8], 4);
        let bytes = match endian {
            Endianness::Little => version.to_le_bytes(),
            Endianness::Big => version.to_be_bytes(),
        };
        let offset = obj.append_section_data(section, &bytes, 4);

        obj.add_symbol(Symbol {
            name: symbol_name.as_bytes().to_vec(),
            value: symbol_value.unwrap_or(offset),
            size: 4,
            kind: SymbolKind::Data,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(section),
            flags: SymbolFlags::None,
        });

        obj.write().expect("object write failed")
    }

    #[test]
    fn test_reads_little_endian_tag() {
        let bytes = artifact(METADATA_SECTION, symbols::XSK_PROG_VERSION, 7, Endianness::Little);
        assert_eq!(read_object_version(&bytes).unwrap(), 7);
    }

    #[test]
    fn test_reads_big_endian_tag() {
        let bytes = artifact(METADATA_SECTION, symbols::XSK_PROG_VERSION, 0x0102_0304, Endianness::Big);
        assert_eq!(read_object_version(&bytes).unwrap(), 0x0102_0304);
    }

    #[test]
    fn test_missing_section() {
        let bytes = artifact(".data", symbols::XSK_PROG_VERSION, 1, Endianness::Little);
        assert!(matches!(read_object_version(&bytes), Err(XskError::Metadata(_))));
    }

    #[test]
    fn test_missing_symbol() {
        let bytes = artifact(METADATA_SECTION, "OTHER", 1, Endianness::Little);
        assert!(matches!(read_object_version(&bytes), Err(XskError::Metadata(_))));
    }

    #[test]
    fn test_symbol_value_near_u64_max() {
        let bytes = artifact_at(
            METADATA_SECTION,
            symbols::XSK_PROG_VERSION,
            1,
            Endianness::Little,
            Some(u64::MAX - 1),
        );
        assert!(matches!(read_object_version(&bytes), Err(XskError::Metadata(_))));
    }

    #[test]
    fn test_symbol_value_past_section_end() {
        // Section holds 12 bytes; a tag starting at 10 would run off the end
        let bytes = artifact_at(METADATA_SECTION, symbols::XSK_PROG_VERSION, 1, Endianness::Little, Some(10));
        assert!(matches!(read_object_version(&bytes), Err(XskError::Metadata(_))));
    }

    #[test]
    fn test_not_an_object() {
        assert!(matches!(
            read_object_version(b"definitely not ELF"),
            Err(XskError::Metadata(_))
        ));
    }

    #[test]
    fn test_compatibility_gate() {
        let current = artifact(METADATA_SECTION, symbols::XSK_PROG_VERSION, XSK_PROG_VERSION, Endianness::Little);
        assert!(ensure_compatible(&current).is_ok());

        let stale = artifact(METADATA_SECTION, symbols::XSK_PROG_VERSION, XSK_PROG_VERSION + 1, Endianness::Little);
        match ensure_compatible(&stale) {
            Err(XskError::VersionMismatch { expected, found }) => {
                assert_eq!(expected, XSK_PROG_VERSION);
                assert_eq!(found, XSK_PROG_VERSION + 1);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
