//! Loaded binary image: the byte provider behind every method body.
//!
//! The container loader is an external collaborator. Analysis only needs
//! bounded reads by virtual address, the executable/non-executable split of
//! mapped memory, and (for key function heuristics) the symbol table. The
//! `BinaryImage` trait captures exactly that; `SegmentedImage` is an
//! in-memory implementation that can also be parsed from ELF/PE/Mach-O
//! files with the `object` crate.

use bitflags::bitflags;
use object::{Object, ObjectSection, ObjectSymbol, SectionKind};
use serde::{Deserialize, Serialize};

use crate::core::address::{AddressRange, VirtualAddress};
use crate::core::binary::Architecture;
use crate::error::{IsilError, Result};

bitflags! {
    /// Memory permissions of a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct RegionPerms: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXECUTE = 0b100;
    }
}

/// Borrowed view of one mapped region.
#[derive(Debug, Clone, Copy)]
pub struct RegionView<'a> {
    pub range: AddressRange,
    pub perms: RegionPerms,
    pub data: &'a [u8],
}

impl<'a> RegionView<'a> {
    pub fn is_executable(&self) -> bool {
        self.perms.contains(RegionPerms::EXECUTE)
    }

    /// Bytes from `va` to the end of the region.
    pub fn tail(&self, va: VirtualAddress) -> Option<&'a [u8]> {
        let offset = self.range.offset_of(va)?;
        self.data.get(offset..)
    }
}

/// A named address from the image's symbol or export tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSymbol {
    pub name: String,
    pub address: VirtualAddress,
}

/// Read access to a loaded binary.
pub trait BinaryImage: Send + Sync {
    /// Architecture detected by the loader.
    fn architecture(&self) -> Architecture;

    /// The mapped region that contains `va`, if any.
    fn region_containing(&self, va: VirtualAddress) -> Option<RegionView<'_>>;

    /// Ranges of every executable region, in address order.
    fn executable_regions(&self) -> Vec<AddressRange>;

    /// Exported/defined symbols with non-zero addresses.
    fn symbols(&self) -> Vec<ImageSymbol> {
        Vec::new()
    }

    /// Read exactly `len` bytes at `va` from a single region.
    fn read(&self, va: VirtualAddress, len: usize) -> Option<&[u8]> {
        let region = self.region_containing(va)?;
        let tail = region.tail(va)?;
        tail.get(..len)
    }

    /// Check whether `va` lies in mapped, executable memory.
    fn is_executable(&self, va: VirtualAddress) -> bool {
        self.region_containing(va)
            .map(|r| r.is_executable())
            .unwrap_or(false)
    }

    /// Executable bytes from `va` to the end of its region.
    fn executable_tail(&self, va: VirtualAddress) -> Option<&[u8]> {
        let region = self.region_containing(va)?;
        if !region.is_executable() {
            return None;
        }
        region.tail(va)
    }
}

#[derive(Debug, Clone)]
struct MappedRegion {
    name: String,
    range: AddressRange,
    perms: RegionPerms,
    data: Vec<u8>,
}

/// An image made of explicitly mapped regions.
#[derive(Debug, Clone)]
pub struct SegmentedImage {
    architecture: Architecture,
    regions: Vec<MappedRegion>,
    symbols: Vec<ImageSymbol>,
}

impl SegmentedImage {
    pub fn new(architecture: Architecture) -> Self {
        Self {
            architecture,
            regions: Vec::new(),
            symbols: Vec::new(),
        }
    }

    /// Map `data` at `base`. Regions are kept sorted by start address.
    pub fn add_region(
        &mut self,
        name: impl Into<String>,
        base: VirtualAddress,
        perms: RegionPerms,
        data: Vec<u8>,
    ) -> &mut Self {
        let range = AddressRange::with_len(base, data.len() as u64);
        let region = MappedRegion {
            name: name.into(),
            range,
            perms,
            data,
        };
        let idx = self
            .regions
            .partition_point(|r| r.range.start < region.range.start);
        self.regions.insert(idx, region);
        self
    }

    /// Convenience for a read+execute region.
    pub fn with_code(mut self, base: VirtualAddress, data: Vec<u8>) -> Self {
        self.add_region(".text", base, RegionPerms::READ | RegionPerms::EXECUTE, data);
        self
    }

    /// Register a symbol name for `address`.
    pub fn add_symbol(&mut self, name: impl Into<String>, address: VirtualAddress) -> &mut Self {
        self.symbols.push(ImageSymbol {
            name: name.into(),
            address,
        });
        self
    }

    /// Names of the mapped regions, in address order.
    pub fn region_names(&self) -> Vec<&str> {
        self.regions.iter().map(|r| r.name.as_str()).collect()
    }

    /// Parse an ELF/PE/Mach-O file and map its initialized sections.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let obj = object::File::parse(data).map_err(|e| IsilError::Image(e.to_string()))?;
        let mut image = SegmentedImage::new(Architecture::from_object(obj.architecture()));

        for sec in obj.sections() {
            if sec.size() == 0 {
                continue;
            }
            let perms = match sec.kind() {
                SectionKind::Text => RegionPerms::READ | RegionPerms::EXECUTE,
                SectionKind::Data | SectionKind::Tls => RegionPerms::READ | RegionPerms::WRITE,
                SectionKind::ReadOnlyData
                | SectionKind::ReadOnlyDataWithRel
                | SectionKind::ReadOnlyString => RegionPerms::READ,
                _ => continue,
            };
            let bytes = match sec.data() {
                Ok(b) if !b.is_empty() => b.to_vec(),
                _ => continue,
            };
            let name = sec.name().unwrap_or("").to_string();
            image.add_region(name, sec.address(), perms, bytes);
        }

        let mut seen = std::collections::HashSet::new();
        for sym in obj.symbols().chain(obj.dynamic_symbols()) {
            if !sym.is_definition() || sym.address() == 0 {
                continue;
            }
            if let Ok(name) = sym.name() {
                if !name.is_empty() && seen.insert((name.to_string(), sym.address())) {
                    image.add_symbol(name, sym.address());
                }
            }
        }
        if let Ok(exports) = obj.exports() {
            for export in exports {
                let name = String::from_utf8_lossy(export.name()).into_owned();
                if export.address() != 0 && seen.insert((name.clone(), export.address())) {
                    image.add_symbol(name, export.address());
                }
            }
        }

        tracing::debug!(
            arch = %image.architecture,
            regions = image.regions.len(),
            symbols = image.symbols.len(),
            "Parsed binary image"
        );
        Ok(image)
    }
}

impl BinaryImage for SegmentedImage {
    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn region_containing(&self, va: VirtualAddress) -> Option<RegionView<'_>> {
        let idx = self.regions.partition_point(|r| r.range.start <= va);
        let region = self.regions[..idx].last()?;
        if !region.range.contains(va) {
            return None;
        }
        Some(RegionView {
            range: region.range,
            perms: region.perms,
            data: &region.data,
        })
    }

    fn executable_regions(&self) -> Vec<AddressRange> {
        self.regions
            .iter()
            .filter(|r| r.perms.contains(RegionPerms::EXECUTE))
            .map(|r| r.range)
            .collect()
    }

    fn symbols(&self) -> Vec<ImageSymbol> {
        self.symbols.clone()
    }
}
