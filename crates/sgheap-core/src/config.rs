//! Heap configuration.
//!
//! Values come from [`HeapConfig::default`], builder methods, or the
//! environment:
//! - `SGHEAP_TOTAL_PAGES`: system page count the admission guard is based on
//!   (decimal or `0x` hex, `_` separators allowed).
//! - `SGHEAP_LOG_CAPACITY`: lifecycle records kept per heap; `0` disables
//!   recording.
//!
//! Malformed values fall back to the defaults.

use crate::size_class::PAGE_SIZE;
use crate::sys;

/// Environment variable overriding [`HeapConfig::total_system_pages`].
pub const ENV_TOTAL_PAGES: &str = "SGHEAP_TOTAL_PAGES";

/// Environment variable overriding [`HeapConfig::log_capacity`].
pub const ENV_LOG_CAPACITY: &str = "SGHEAP_LOG_CAPACITY";

/// Lifecycle records kept per heap by default.
pub const DEFAULT_LOG_CAPACITY: usize = 4096;

/// Page count assumed when the host does not report its memory (1GB).
pub const FALLBACK_TOTAL_PAGES: usize = (1 << 30) / PAGE_SIZE;

/// Heap construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Total system pages. A single request larger than half of this is
    /// rejected before any pool is touched.
    pub total_system_pages: usize,
    /// Bound on the lifecycle log.
    pub log_capacity: usize,
    /// Label used in trace ids and reports.
    pub heap_name: String,
    /// Most entries a scatter-gather table may hold; `None` for no limit.
    /// Building a longer table fails as a metadata allocation failure.
    pub max_sg_entries: Option<usize>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            total_system_pages: sys::physical_page_count().unwrap_or(FALLBACK_TOTAL_PAGES),
            log_capacity: DEFAULT_LOG_CAPACITY,
            heap_name: String::from("system"),
            max_sg_entries: None,
        }
    }
}

impl HeapConfig {
    /// Defaults overridden by the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup`, which maps a variable name to its value.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(pages) = lookup(ENV_TOTAL_PAGES).and_then(|raw| parse_count(&raw)) {
            config.total_system_pages = pages;
        }
        if let Some(capacity) = lookup(ENV_LOG_CAPACITY).and_then(|raw| parse_count(&raw)) {
            config.log_capacity = capacity;
        }
        config
    }

    #[must_use]
    pub fn with_total_system_pages(mut self, pages: usize) -> Self {
        self.total_system_pages = pages;
        self
    }

    #[must_use]
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_heap_name(mut self, name: impl Into<String>) -> Self {
        self.heap_name = name.into();
        self
    }

    #[must_use]
    pub fn with_max_sg_entries(mut self, max: usize) -> Self {
        self.max_sg_entries = Some(max);
        self
    }

    /// Largest admissible request, in pages.
    #[must_use]
    pub fn admission_limit_pages(&self) -> usize {
        self.total_system_pages / 2
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal count.
fn parse_count(raw: &str) -> Option<usize> {
    let cleaned: String = raw.trim().chars().filter(|&c| c != '_').collect();
    match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => cleaned.parse().ok(),
    }
}
