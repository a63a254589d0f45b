//! Device configuration record and option-string parser.
//!
//! Configuration comes in two equivalent ways: populate [`DeviceConfig`]
//! directly, or hand [`DeviceConfig::from_option_str`] the semicolon
//! grammar the original module parameter used
//! (`"ntsY;wbY;cacheWC;bufsize16;batch4;rdlat1500"`). Either way
//! activation runs [`DeviceConfig::validated`], and every malformed or
//! inconsistent combination fails with `BadConfig`.

use pmbd_emul::EmulParams;
use pmbd_error::{PmbdError, Result};
use pmbd_types::{CacheMode, DeviceGeometry, SimMode, WpMode};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Smallest allowed buffer size: 4 MiB.
pub const MIN_BUFFER_BYTES: u64 = 4 << 20;
/// Default flush batch, in blocks.
pub const DEFAULT_BATCH_BLOCKS: u64 = 1024;
/// Default routing stride, in blocks.
pub const DEFAULT_BUFFER_STRIDE: u64 = 1024;

/// DRAM write-buffer geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Total buffer bytes per buffer (>= 4 MiB).
    pub size_bytes: u64,
    /// Number of independent buffers.
    pub count: u32,
    /// Contiguous blocks routed to the same buffer.
    pub stride: u64,
    /// Blocks cleaned per flush batch.
    pub batch: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size_bytes: MIN_BUFFER_BYTES,
            count: 1,
            stride: DEFAULT_BUFFER_STRIDE,
            batch: DEFAULT_BATCH_BLOCKS,
        }
    }
}

/// Immutable per-device configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device capacity in 512-byte sectors.
    pub num_sectors: u64,
    /// Cacheability of the region's pages.
    pub cache: CacheMode,
    /// Non-temporal stores plus store-fence on the write path.
    pub nts: bool,
    /// Non-temporal loads on the read path (forces `cache = WC`).
    pub ntl: bool,
    /// Cache-line flush after every write range.
    pub clflush: bool,
    /// Honour FLUSH requests as write barriers.
    pub wb: bool,
    /// Honour the FUA request flag.
    pub fua: bool,
    /// Keep region pages read-only outside RW windows.
    pub wrprot: bool,
    /// How RW windows are opened under `wrprot`.
    pub wpmode: WpMode,
    /// Read back and compare after every write.
    pub wrverify: bool,
    /// Maintain the per-block checksum table.
    pub checksum: bool,
    /// Serialise per-block accesses through the PBI lock on the
    /// unbuffered paths.
    pub lock: bool,
    /// Store only changed cache lines.
    pub subupdate: bool,
    /// Record the per-stage cycle breakdown.
    pub timestat: bool,
    /// DRAM write buffer, when present.
    pub buffer: Option<BufferConfig>,
    /// Latency/bandwidth emulation parameters.
    pub emul: EmulParams,
}

impl DeviceConfig {
    /// Defaults mirror the original driver: FUA honoured, per-block
    /// locking on, everything else off.
    #[must_use]
    pub fn new(num_sectors: u64) -> Self {
        Self {
            num_sectors,
            cache: CacheMode::Wb,
            nts: false,
            ntl: false,
            clflush: false,
            wb: false,
            fua: true,
            wrprot: false,
            wpmode: WpMode::Pte,
            wrverify: false,
            checksum: false,
            lock: true,
            subupdate: false,
            timestat: false,
            buffer: None,
            emul: EmulParams::default(),
        }
    }

    /// Parse the option-string grammar on top of the defaults.
    pub fn from_option_str(num_sectors: u64, options: &str) -> Result<Self> {
        let mut config = Self::new(num_sectors);
        let mut raw = RawBufferOptions::default();
        for token in options.split(';') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            config.apply_token(token, &mut raw)?;
        }
        raw.assemble(&mut config)?;
        config.validated()
    }

    fn apply_token(&mut self, token: &str, raw: &mut RawBufferOptions) -> Result<()> {
        // Boolean options: tag followed by Y or N.
        const BOOLS: [&str; 11] = [
            "wrverify", "subupdate", "timestat", "checksum", "clflush", "wrprot", "lock", "nts",
            "ntl", "fua", "wb",
        ];
        for tag in BOOLS {
            if let Some(rest) = token.strip_prefix(tag) {
                let value = parse_bool(token, rest)?;
                match tag {
                    "wrverify" => self.wrverify = value,
                    "subupdate" => self.subupdate = value,
                    "timestat" => self.timestat = value,
                    "checksum" => self.checksum = value,
                    "clflush" => self.clflush = value,
                    "wrprot" => self.wrprot = value,
                    "lock" => self.lock = value,
                    "nts" => self.nts = value,
                    "ntl" => self.ntl = value,
                    "fua" => self.fua = value,
                    "wb" => self.wb = value,
                    _ => unreachable!(),
                }
                return Ok(());
            }
        }

        // Enum-valued options.
        if let Some(rest) = token.strip_prefix("cache") {
            self.cache = rest
                .parse::<CacheMode>()
                .map_err(|err| PmbdError::BadConfig(err.to_string()))?;
            return Ok(());
        }
        if let Some(rest) = token.strip_prefix("wpmode") {
            self.wpmode = rest
                .parse::<WpMode>()
                .map_err(|err| PmbdError::BadConfig(err.to_string()))?;
            return Ok(());
        }
        if let Some(rest) = token.strip_prefix("simmode") {
            self.emul.simmode = rest
                .parse::<SimMode>()
                .map_err(|err| PmbdError::BadConfig(err.to_string()))?;
            return Ok(());
        }

        // Numeric options. Longest tags first so shared prefixes
        // (bufsize/bufstride, rdlat/rdbw) never mis-match.
        const NUMS: [&str; 12] = [
            "bufstride", "rdpause", "wrpause", "bufsize", "bufnum", "batch", "rdlat", "wrlat",
            "rdbw", "wrbw", "rdsx", "wrsx",
        ];
        for tag in NUMS {
            if let Some(rest) = token.strip_prefix(tag) {
                let value = parse_u64(token, rest)?;
                match tag {
                    "bufstride" => raw.stride = Some(value),
                    "rdpause" => self.emul.rdpause_cycles = value,
                    "wrpause" => self.emul.wrpause_cycles = value,
                    "bufsize" => raw.size_mb = Some(value),
                    "bufnum" => raw.count = Some(value),
                    "batch" => raw.batch = Some(value),
                    "rdlat" => self.emul.rdlat_ns = value,
                    "wrlat" => self.emul.wrlat_ns = value,
                    "rdbw" => self.emul.rdbw_mbs = value,
                    "wrbw" => self.emul.wrbw_mbs = value,
                    "rdsx" => self.emul.rdsx = u32::try_from(value).unwrap_or(u32::MAX),
                    "wrsx" => self.emul.wrsx = u32::try_from(value).unwrap_or(u32::MAX),
                    _ => unreachable!(),
                }
                return Ok(());
            }
        }

        Err(PmbdError::BadConfig(format!("unknown option: {token:?}")))
    }

    /// Normalise and cross-check the record; activation runs this.
    pub fn validated(mut self) -> Result<Self> {
        // Early geometry check so a bad capacity fails as BadConfig.
        DeviceGeometry::with_default_sizes(self.num_sectors)
            .map_err(|err| PmbdError::BadConfig(err.to_string()))?;

        if self.ntl && self.cache != CacheMode::Wc {
            // Non-temporal loads only make sense on write-combining pages.
            debug!(
                target: "pmbd::config",
                event = "cache_mode_forced",
                from = self.cache.as_str(),
                to = "WC",
                reason = "ntl"
            );
            self.cache = CacheMode::Wc;
        }

        if let Some(buffer) = &self.buffer {
            if buffer.size_bytes < MIN_BUFFER_BYTES {
                return Err(PmbdError::BadConfig(format!(
                    "buffer size {} below the {} byte minimum",
                    buffer.size_bytes, MIN_BUFFER_BYTES
                )));
            }
            if buffer.count == 0 {
                return Err(PmbdError::BadConfig("buffer count must be >= 1".to_owned()));
            }
            if buffer.stride == 0 {
                return Err(PmbdError::BadConfig(
                    "buffer stride must be >= 1".to_owned(),
                ));
            }
            if buffer.batch == 0 {
                return Err(PmbdError::BadConfig("flush batch must be >= 1".to_owned()));
            }
        }

        Ok(self)
    }

    /// The validated geometry for this configuration.
    pub fn geometry(&self) -> Result<DeviceGeometry> {
        DeviceGeometry::with_default_sizes(self.num_sectors)
            .map_err(|err| PmbdError::BadConfig(err.to_string()))
    }
}

#[derive(Debug, Default)]
struct RawBufferOptions {
    size_mb: Option<u64>,
    count: Option<u64>,
    stride: Option<u64>,
    batch: Option<u64>,
}

impl RawBufferOptions {
    fn assemble(self, config: &mut DeviceConfig) -> Result<()> {
        match self.size_mb {
            None | Some(0) => {
                // bufsize0 disables buffering; stray bufnum/bufstride/batch
                // knobs without a size are ignored the way the original
                // module parameters were.
                config.buffer = None;
            }
            Some(mb) => {
                let defaults = BufferConfig::default();
                config.buffer = Some(BufferConfig {
                    size_bytes: mb << 20,
                    count: u32::try_from(self.count.unwrap_or(u64::from(defaults.count)))
                        .map_err(|_| {
                            PmbdError::BadConfig("buffer count does not fit u32".to_owned())
                        })?,
                    stride: self.stride.unwrap_or(defaults.stride),
                    batch: self.batch.unwrap_or(defaults.batch),
                });
            }
        }
        Ok(())
    }
}

fn parse_bool(token: &str, rest: &str) -> Result<bool> {
    match rest {
        "Y" => Ok(true),
        "N" => Ok(false),
        _ => Err(PmbdError::BadConfig(format!(
            "option {token:?}: expected Y or N"
        ))),
    }
}

fn parse_u64(token: &str, rest: &str) -> Result<u64> {
    rest.parse::<u64>()
        .map_err(|_| PmbdError::BadConfig(format!("option {token:?}: expected a number")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_original_driver() {
        let config = DeviceConfig::new(128);
        assert!(config.fua);
        assert!(config.lock);
        assert!(!config.wb);
        assert!(!config.wrprot);
        assert_eq!(config.cache, CacheMode::Wb);
        assert!(config.buffer.is_none());
    }

    #[test]
    fn parses_a_recommended_config() {
        let config =
            DeviceConfig::from_option_str(128, "ntsY;wbY;cacheWB;wrprotY;wpmode0").expect("parse");
        assert!(config.nts);
        assert!(config.wb);
        assert!(config.wrprot);
        assert_eq!(config.wpmode, WpMode::Pte);
    }

    #[test]
    fn parses_buffer_and_emulation_knobs() {
        let config = DeviceConfig::from_option_str(
            128,
            "bufsize16;bufnum2;bufstride1;batch4;rdlat1500;wrbw200;simmode1",
        )
        .expect("parse");
        let buffer = config.buffer.expect("buffer enabled");
        assert_eq!(buffer.size_bytes, 16 << 20);
        assert_eq!(buffer.count, 2);
        assert_eq!(buffer.stride, 1);
        assert_eq!(buffer.batch, 4);
        assert_eq!(config.emul.rdlat_ns, 1500);
        assert_eq!(config.emul.wrbw_mbs, 200);
        assert_eq!(config.emul.simmode, SimMode::PmOnly);
    }

    #[test]
    fn bufsize_zero_disables_buffering() {
        let config = DeviceConfig::from_option_str(128, "bufsize0;batch8").expect("parse");
        assert!(config.buffer.is_none());
    }

    #[test]
    fn rejects_unknown_and_malformed_options() {
        assert!(matches!(
            DeviceConfig::from_option_str(128, "frobnicateY"),
            Err(PmbdError::BadConfig(_))
        ));
        assert!(matches!(
            DeviceConfig::from_option_str(128, "ntsX"),
            Err(PmbdError::BadConfig(_))
        ));
        assert!(matches!(
            DeviceConfig::from_option_str(128, "rdlatfast"),
            Err(PmbdError::BadConfig(_))
        ));
        assert!(matches!(
            DeviceConfig::from_option_str(128, "cacheZZ"),
            Err(PmbdError::BadConfig(_))
        ));
    }

    #[test]
    fn rejects_undersized_buffer() {
        assert!(matches!(
            DeviceConfig::from_option_str(128, "bufsize2"),
            Err(PmbdError::BadConfig(_))
        ));
    }

    #[test]
    fn ntl_forces_write_combining() {
        let config = DeviceConfig::from_option_str(128, "ntlY;cacheWB").expect("parse");
        assert_eq!(config.cache, CacheMode::Wc);
    }

    #[test]
    fn wrverify_and_wrprot_tags_do_not_collide() {
        let config = DeviceConfig::from_option_str(128, "wrverifyY;wrprotN").expect("parse");
        assert!(config.wrverify);
        assert!(!config.wrprot);
    }

    #[test]
    fn misaligned_capacity_is_bad_config() {
        assert!(matches!(
            DeviceConfig::from_option_str(7, ""),
            Err(PmbdError::BadConfig(_))
        ));
    }
}
