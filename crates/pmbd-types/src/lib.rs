#![forbid(unsafe_code)]
//! Shared identifiers, device geometry, and option enums for the PMBD
//! emulator.
//!
//! Everything here is a plain value type: unit-carrying newtypes that keep
//! sectors, physical blocks, and buffer slots from being mixed up, a
//! validated [`DeviceGeometry`], and the enums behind the device
//! configuration record.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Sector size in bytes (request-level unit).
pub const SECTOR_SIZE: u32 = 512;
/// log2 of [`SECTOR_SIZE`].
pub const SECTOR_SHIFT: u32 = 9;
/// Default block size in bytes (one page).
pub const BLOCK_SIZE: u32 = 4096;
/// log2 of [`BLOCK_SIZE`].
pub const BLOCK_SHIFT: u32 = 12;
/// Cache line size in bytes; the unit of non-temporal copy alignment and
/// of `subupdate` comparison.
pub const CACHE_LINE_SIZE: usize = 64;

/// Physical block number inside one device's memory region.
///
/// Dense, starting at 0. One block holds a fixed number of sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pbn(pub u64);

impl Pbn {
    /// Whether `other` is the block immediately after `self`.
    #[must_use]
    pub fn is_followed_by(self, other: Self) -> bool {
        other.0 == self.0 + 1
    }
}

impl fmt::Display for Pbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pbn{}", self.0)
    }
}

/// Index into one buffer's slot array (0 ≤ bbn < capacity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bbn(pub u64);

impl fmt::Display for Bbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bbn{}", self.0)
    }
}

/// 512-byte sector number (request addressing unit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorNumber(pub u64);

impl fmt::Display for SectorNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sector{}", self.0)
    }
}

/// Request direction. Doubles as an index for per-direction state pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dir {
    Read,
    Write,
}

impl Dir {
    /// Stable index for `[read, write]` arrays.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Read => 0,
            Self::Write => 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

bitflags::bitflags! {
    /// Per-request flags.
    ///
    /// `SYNC` is accepted and counted but carries no core semantics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReqFlags: u32 {
        const FLUSH = 1 << 0;
        const FUA   = 1 << 1;
        const SYNC  = 1 << 2;
    }
}

/// Failed parse of an option enum value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {field} value: {value:?}")]
pub struct InvalidOptionValue {
    pub field: &'static str,
    pub value: String,
}

/// CPU cacheability of the region's pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CacheMode {
    /// Write-back (default).
    #[default]
    Wb,
    /// Write-combining.
    Wc,
    /// Uncacheable, strongly ordered.
    Uc,
    /// Uncacheable, overridable by WC.
    UcMinus,
}

impl CacheMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wb => "WB",
            Self::Wc => "WC",
            Self::Uc => "UC",
            Self::UcMinus => "UC-",
        }
    }

    /// Whether stores under this mode need a trailing store-fence.
    #[must_use]
    pub fn needs_store_fence(self) -> bool {
        matches!(self, Self::Wc | Self::UcMinus)
    }
}

impl FromStr for CacheMode {
    type Err = InvalidOptionValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WB" => Ok(Self::Wb),
            "WC" => Ok(Self::Wc),
            "UC" => Ok(Self::Uc),
            "UC-" | "UM" => Ok(Self::UcMinus),
            other => Err(InvalidOptionValue {
                field: "cache",
                value: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a write window is opened under `wrprot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WpMode {
    /// Mutate page-table entries for the covered range. O(pages) per window.
    #[default]
    Pte,
    /// Flip the processor-wide write-protect enable inside an
    /// interrupts-off critical section. O(1), but processor-global.
    Cr0,
}

impl WpMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pte => "PTE",
            Self::Cr0 => "CR0",
        }
    }
}

impl FromStr for WpMode {
    type Err = InvalidOptionValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" | "PTE" => Ok(Self::Pte),
            "1" | "CR0" => Ok(Self::Cr0),
            other => Err(InvalidOptionValue {
                field: "wpmode",
                value: other.to_owned(),
            }),
        }
    }
}

/// What the latency/bandwidth emulation wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SimMode {
    /// Wrap each whole request (device-level emulation).
    #[default]
    WholeDevice,
    /// Wrap each memcpy touching the region (PM-space emulation; used to
    /// simulate slow PM behind the DRAM buffer).
    PmOnly,
}

impl FromStr for SimMode {
    type Err = InvalidOptionValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" => Ok(Self::WholeDevice),
            "1" => Ok(Self::PmOnly),
            other => Err(InvalidOptionValue {
                field: "simmode",
                value: other.to_owned(),
            }),
        }
    }
}

/// Validated device geometry: capacity, sector size, block size.
///
/// Invariants established at construction: sector and block sizes are
/// powers of two, the block size is a whole multiple of the sector size,
/// and the capacity is block-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGeometry {
    num_sectors: u64,
    sector_size: u32,
    block_size: u32,
}

/// Geometry validation failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid sector_size {0}: must be a power of two >= 512")]
    SectorSize(u32),
    #[error("invalid block_size {0}: must be a power-of-two multiple of the sector size")]
    BlockSize(u32),
    #[error("capacity of {num_sectors} sectors is not aligned to {block_size}-byte blocks")]
    UnalignedCapacity { num_sectors: u64, block_size: u32 },
    #[error("capacity must be non-zero")]
    Empty,
}

impl DeviceGeometry {
    pub fn new(num_sectors: u64, sector_size: u32, block_size: u32) -> Result<Self, GeometryError> {
        if sector_size < 512 || !sector_size.is_power_of_two() {
            return Err(GeometryError::SectorSize(sector_size));
        }
        if !block_size.is_power_of_two() || block_size < sector_size {
            return Err(GeometryError::BlockSize(block_size));
        }
        if num_sectors == 0 {
            return Err(GeometryError::Empty);
        }
        let sectors_per_block = u64::from(block_size / sector_size);
        if num_sectors % sectors_per_block != 0 {
            return Err(GeometryError::UnalignedCapacity {
                num_sectors,
                block_size,
            });
        }
        Ok(Self {
            num_sectors,
            sector_size,
            block_size,
        })
    }

    /// Default geometry: 512-byte sectors, 4 KiB blocks.
    pub fn with_default_sizes(num_sectors: u64) -> Result<Self, GeometryError> {
        Self::new(num_sectors, SECTOR_SIZE, BLOCK_SIZE)
    }

    #[must_use]
    pub fn num_sectors(self) -> u64 {
        self.num_sectors
    }

    #[must_use]
    pub fn sector_size(self) -> u32 {
        self.sector_size
    }

    #[must_use]
    pub fn block_size(self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn sectors_per_block(self) -> u64 {
        u64::from(self.block_size / self.sector_size)
    }

    #[must_use]
    pub fn total_bytes(self) -> u64 {
        self.num_sectors * u64::from(self.sector_size)
    }

    #[must_use]
    pub fn total_blocks(self) -> u64 {
        self.total_bytes() / u64::from(self.block_size)
    }

    /// Byte offset of a sector inside the region.
    #[must_use]
    pub fn sector_to_byte(self, sector: SectorNumber) -> u64 {
        sector.0 * u64::from(self.sector_size)
    }

    /// The block containing a sector.
    #[must_use]
    pub fn sector_to_pbn(self, sector: SectorNumber) -> Pbn {
        Pbn(self.sector_to_byte(sector) / u64::from(self.block_size))
    }

    /// The block containing a byte offset.
    #[must_use]
    pub fn byte_to_pbn(self, byte: u64) -> Pbn {
        Pbn(byte / u64::from(self.block_size))
    }

    /// First sector of a block.
    #[must_use]
    pub fn pbn_to_sector(self, pbn: Pbn) -> SectorNumber {
        SectorNumber(pbn.0 * self.sectors_per_block())
    }

    /// Byte offset of a block inside the region.
    #[must_use]
    pub fn pbn_to_byte(self, pbn: Pbn) -> u64 {
        pbn.0 * u64::from(self.block_size)
    }

    /// Whether `(sector, len_bytes)` lies entirely inside the device.
    #[must_use]
    pub fn contains(self, sector: SectorNumber, len_bytes: usize) -> bool {
        let Some(end) = self
            .sector_to_byte(sector)
            .checked_add(len_bytes as u64)
        else {
            return false;
        };
        end <= self.total_bytes()
    }

    /// Number of bytes a request covers, rounded to whole sectors.
    #[must_use]
    pub fn bytes_to_sectors(self, len_bytes: usize) -> u64 {
        (len_bytes as u64).div_ceil(u64::from(self.sector_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_rejects_misaligned_capacity() {
        // 9 sectors of 512 B is not a whole number of 4 KiB blocks.
        let err = DeviceGeometry::with_default_sizes(9).unwrap_err();
        assert!(matches!(err, GeometryError::UnalignedCapacity { .. }));
    }

    #[test]
    fn geometry_conversions_round_trip() {
        let geo = DeviceGeometry::with_default_sizes(128).expect("geometry");
        assert_eq!(geo.total_blocks(), 16);
        assert_eq!(geo.sectors_per_block(), 8);
        assert_eq!(geo.sector_to_pbn(SectorNumber(7)), Pbn(0));
        assert_eq!(geo.sector_to_pbn(SectorNumber(8)), Pbn(1));
        assert_eq!(geo.pbn_to_sector(Pbn(2)), SectorNumber(16));
        assert_eq!(geo.pbn_to_byte(Pbn(2)), 8192);
        assert_eq!(geo.byte_to_pbn(8191), Pbn(1));
    }

    #[test]
    fn geometry_capacity_boundary() {
        let geo = DeviceGeometry::with_default_sizes(128).expect("geometry");
        assert!(geo.contains(SectorNumber(127), 512));
        assert!(!geo.contains(SectorNumber(127), 513));
        assert!(!geo.contains(SectorNumber(128), 1));
        // An empty request at the boundary is in range.
        assert!(geo.contains(SectorNumber(128), 0));
    }

    #[test]
    fn cache_mode_parse_and_fence_rule() {
        assert_eq!("WB".parse::<CacheMode>().unwrap(), CacheMode::Wb);
        assert_eq!("UC-".parse::<CacheMode>().unwrap(), CacheMode::UcMinus);
        assert!("wb".parse::<CacheMode>().is_err());
        assert!(CacheMode::Wc.needs_store_fence());
        assert!(CacheMode::UcMinus.needs_store_fence());
        assert!(!CacheMode::Wb.needs_store_fence());
        assert!(!CacheMode::Uc.needs_store_fence());
    }

    #[test]
    fn wpmode_accepts_numeric_and_symbolic_forms() {
        assert_eq!("0".parse::<WpMode>().unwrap(), WpMode::Pte);
        assert_eq!("CR0".parse::<WpMode>().unwrap(), WpMode::Cr0);
        assert!("2".parse::<WpMode>().is_err());
    }

    #[test]
    fn contiguity_helper() {
        assert!(Pbn(4).is_followed_by(Pbn(5)));
        assert!(!Pbn(4).is_followed_by(Pbn(6)));
        assert!(!Pbn(4).is_followed_by(Pbn(4)));
    }
}
