//! Named configuration parameters for the buffer pool (module prefix
//! `Buffer_` in the external interface).
//!
//! Values are read from the process environment at first use, cached for
//! the remainder of the process, and can be dropped with [`reset`] so
//! tests can exercise a fresh set of values. `get()` assembles every
//! parameter in dependency order — pool sizes first, since table sizes
//! below them could in principle scale with the normal pool's budget.

use crate::Class;
use common::{DbError, DbResult};
use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// How the 32-bit footer CRC is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumMode {
    /// Never compute or verify the footer CRC.
    None,
    /// Compute it unless the owning file opted out (`BufferFile::no_crc`).
    Specified,
    /// Always compute and verify it, regardless of per-file preference.
    All,
}

impl ChecksumMode {
    fn parse(raw: &str) -> DbResult<Self> {
        match raw {
            "None" | "none" => Ok(ChecksumMode::None),
            "Specified" | "specified" => Ok(ChecksumMode::Specified),
            "All" | "all" => Ok(ChecksumMode::All),
            other => Err(DbError::BadArgument(format!(
                "invalid CalculateCheckSum value: {other}"
            ))),
        }
    }
}

/// A process-wide reserve held back from the OS's open-file limit so that
/// non-buffer code always has descriptors available.
pub const RESERVED_DESCRIPTORS: usize = 100;

/// `OPEN_MAX` is not queryable from stable `std` without a platform crate;
/// 1024 is the common default `ulimit -n` on Linux and macOS. Operators
/// needing a different budget set `BUFFER_OPEN_FILE_COUNT_MAX` directly.
const ASSUMED_OPEN_MAX: usize = 1024;

/// Process default for every `Buffer_*` parameter from the external
/// interface table. `Configuration::from_env` starts from these and
/// layers `BUFFER_*` environment overrides on top field by field; the
/// literal defaults live here, once, as `bon` builder attributes rather
/// than duplicated between a `Default` impl and the env-parsing code.
#[derive(Clone, Debug, bon::Builder)]
pub struct Configuration {
    #[builder(default = 1031)]
    pub file_table_size: usize,
    #[builder(default = 0o600)]
    pub file_permission: u32,
    #[builder(default = 8192)]
    pub page_table_size: usize,
    #[builder(default = storage::DEFAULT_PAGE_SIZE_MAX)]
    pub page_size_max: usize,
    #[builder(default = 5000)]
    pub dirty_page_flusher_period_ms: u64,
    #[builder(default = 95)]
    pub flush_page_coefficient: u8,
    #[builder(default = 100)]
    pub free_page_count_max: usize,
    #[builder(default = 36_000_000)]
    pub keeping_used_memory_time_max_ms: u64,
    #[builder(default = 1024 * 1024 * 1024)]
    pub normal_pool_size: usize,
    #[builder(default = 64 * 1024 * 1024)]
    pub temporary_pool_size: usize,
    #[builder(default = 64 * 1024 * 1024)]
    pub read_only_pool_size: usize,
    #[builder(default = 5 * 1024 * 1024)]
    pub logical_log_pool_size: usize,
    #[builder(default = ASSUMED_OPEN_MAX.saturating_sub(RESERVED_DESCRIPTORS))]
    pub open_file_count_max: usize,
    #[builder(default = ChecksumMode::Specified)]
    pub calculate_checksum: ChecksumMode,
    #[builder(default = true)]
    pub delay_temporary_creation: bool,
    #[builder(default = 3)]
    pub retry_allocation_count_max: u32,
    #[builder(default = 8000)]
    pub flushing_body_count_max: usize,
    #[builder(default = 500)]
    pub skip_dirty_candidate_count_max: usize,
    #[builder(default = 64 * 1024)]
    pub read_ahead_block_size: usize,
    #[builder(default = 0)]
    pub statistics_reporter_period_ms: u64,
}

impl Configuration {
    fn from_env() -> DbResult<Self> {
        let defaults = Configuration::builder().build();

        let normal_pool_size = env_size("NORMAL_POOL_SIZE", defaults.normal_pool_size)?;
        let temporary_pool_size = env_size("TEMPORARY_POOL_SIZE", defaults.temporary_pool_size)?;
        let read_only_pool_size = env_size("READ_ONLY_POOL_SIZE", defaults.read_only_pool_size)?;
        let logical_log_pool_size = env_size("LOGICAL_LOG_POOL_SIZE", defaults.logical_log_pool_size)?;

        let file_table_size = env_size("FILE_TABLE_SIZE", defaults.file_table_size)?;
        let file_permission = env_u64("FILE_PERMISSION", defaults.file_permission as u64)? as u32;
        let page_table_size = env_size("PAGE_TABLE_SIZE", defaults.page_table_size)?;
        let page_size_max = env_size("PAGE_SIZE_MAX", defaults.page_size_max)?;
        let dirty_page_flusher_period_ms =
            env_u64("DIRTY_PAGE_FLUSHER_PERIOD", defaults.dirty_page_flusher_period_ms)?;
        let flush_page_coefficient = env_u64("FLUSH_PAGE_COEFFICIENT", defaults.flush_page_coefficient as u64)?
            .min(100) as u8;
        let free_page_count_max = env_size("FREE_PAGE_COUNT_MAX", defaults.free_page_count_max)?;
        let keeping_used_memory_time_max_ms = env_u64(
            "KEEPING_USED_MEMORY_TIME_MAX",
            defaults.keeping_used_memory_time_max_ms,
        )?;
        let open_file_count_max = env_size("OPEN_FILE_COUNT_MAX", defaults.open_file_count_max)?;
        let calculate_checksum = match std::env::var("BUFFER_CALCULATE_CHECK_SUM") {
            Ok(v) => ChecksumMode::parse(&v)?,
            Err(_) => defaults.calculate_checksum,
        };
        let delay_temporary_creation = env_bool("DELAY_TEMPORARY_CREATION", defaults.delay_temporary_creation)?;
        let retry_allocation_count_max =
            env_u64("RETRY_ALLOCATION_COUNT_MAX", defaults.retry_allocation_count_max as u64)? as u32;
        let flushing_body_count_max = env_size("FLUSHING_BODY_COUNT_MAX", defaults.flushing_body_count_max)?;
        let skip_dirty_candidate_count_max =
            env_size("SKIP_DIRTY_CANDIDATE_COUNT_MAX", defaults.skip_dirty_candidate_count_max)?;
        let read_ahead_block_size =
            env_size("READ_AHEAD_BLOCK_SIZE", defaults.read_ahead_block_size)?.min(512 * 1024);
        let statistics_reporter_period_ms =
            env_u64("STATISTICS_REPORTER_PERIOD", defaults.statistics_reporter_period_ms)?;

        Ok(Self {
            file_table_size,
            file_permission,
            page_table_size,
            page_size_max,
            dirty_page_flusher_period_ms,
            flush_page_coefficient,
            free_page_count_max,
            keeping_used_memory_time_max_ms,
            normal_pool_size,
            temporary_pool_size,
            read_only_pool_size,
            logical_log_pool_size,
            open_file_count_max,
            calculate_checksum,
            delay_temporary_creation,
            retry_allocation_count_max,
            flushing_body_count_max,
            skip_dirty_candidate_count_max,
            read_ahead_block_size,
            statistics_reporter_period_ms,
        })
    }

    pub fn pool_size_limit(&self, class: Class) -> usize {
        match class {
            Class::Normal => self.normal_pool_size,
            Class::Temporary => self.temporary_pool_size,
            Class::ReadOnly => self.read_only_pool_size,
            Class::LogicalLog => self.logical_log_pool_size,
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::from_env().expect("default configuration never fails to parse")
    }
}

static CACHE: Lazy<RwLock<Option<Configuration>>> = Lazy::new(|| RwLock::new(None));

/// Return the cached configuration, loading it from the environment on
/// first call.
pub fn get() -> DbResult<Configuration> {
    if let Some(cfg) = CACHE.read().as_ref() {
        return Ok(cfg.clone());
    }
    let mut guard = CACHE.write();
    if let Some(cfg) = guard.as_ref() {
        return Ok(cfg.clone());
    }
    let cfg = Configuration::from_env()?;
    *guard = Some(cfg.clone());
    Ok(cfg)
}

/// Drop the cached configuration so the next [`get`] re-reads the
/// environment. Intended for tests that need to vary `BUFFER_*` values
/// between cases.
pub fn reset() {
    *CACHE.write() = None;
}

/// Parse a size value with an optional `K`/`M`/`G`/`T` suffix (binary
/// multiples).
pub fn parse_size(raw: &str) -> DbResult<usize> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DbError::BadArgument("empty size value".into()));
    }
    let (digits, mult) = match raw.chars().last().unwrap() {
        'K' | 'k' => (&raw[..raw.len() - 1], 1024usize),
        'M' | 'm' => (&raw[..raw.len() - 1], 1024 * 1024),
        'G' | 'g' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        'T' | 't' => (&raw[..raw.len() - 1], 1024usize * 1024 * 1024 * 1024),
        _ => (raw, 1),
    };
    let base: usize = digits
        .trim()
        .parse()
        .map_err(|_| DbError::BadArgument(format!("invalid size value: {raw}")))?;
    Ok(base * mult)
}

fn env_size(name: &str, default: usize) -> DbResult<usize> {
    match std::env::var(format!("BUFFER_{name}")) {
        Ok(v) => parse_size(&v),
        Err(_) => Ok(default),
    }
}

fn env_u64(name: &str, default: u64) -> DbResult<u64> {
    match std::env::var(format!("BUFFER_{name}")) {
        Ok(v) => v
            .parse()
            .map_err(|_| DbError::BadArgument(format!("invalid integer for BUFFER_{name}: {v}"))),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> DbResult<bool> {
    match std::env::var(format!("BUFFER_{name}")) {
        Ok(v) => match v.as_str() {
            "1" | "true" | "TRUE" | "True" => Ok(true),
            "0" | "false" | "FALSE" | "False" => Ok(false),
            other => Err(DbError::BadArgument(format!(
                "invalid boolean for BUFFER_{name}: {other}"
            ))),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_accepts_suffixes() {
        assert_eq!(parse_size("100").unwrap(), 100);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
    }

    #[test]
    fn defaults_match_external_interface_table() {
        reset();
        let cfg = get().unwrap();
        assert_eq!(cfg.file_table_size, 1031);
        assert_eq!(cfg.page_table_size, 8192);
        assert_eq!(cfg.retry_allocation_count_max, 3);
        assert_eq!(cfg.flushing_body_count_max, 8000);
        assert_eq!(cfg.skip_dirty_candidate_count_max, 500);
        assert!(cfg.delay_temporary_creation);
        assert_eq!(cfg.statistics_reporter_period_ms, 0);
        assert!(matches!(cfg.calculate_checksum, ChecksumMode::Specified));
    }

    #[test]
    fn pool_size_limit_selects_the_right_class() {
        reset();
        let cfg = get().unwrap();
        assert_eq!(cfg.pool_size_limit(Class::LogicalLog), cfg.logical_log_pool_size);
        assert_eq!(cfg.pool_size_limit(Class::Normal), cfg.normal_pool_size);
    }
}
