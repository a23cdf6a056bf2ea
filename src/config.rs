//! Settings for a [`MemoryManager`](crate::MemoryManager), from JSON or from
//! the environment.
//!
//! ```json
//! { "log_granularity_ms": 20, "page_pool": { "size": "512M" } }
//! ```
//!
//! A page pool size of `0` means "every free huge page".

use std::{env, fmt, time::Duration};

use serde::{de::Visitor, Deserialize, Deserializer, Serialize, Serializer};

use crate::{error::MemError, monitor::DEFAULT_GRANULARITY};

pub const ENV_LOG_GRANULARITY_MS: &str = "BITMEM_LOG_GRANULARITY_MS";
pub const ENV_PAGE_POOL: &str = "BITMEM_PAGE_POOL";

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;
const GIB: usize = 1024 * MIB;

/// A byte count written for humans: `"64K"`, `"512MB"`, `"1GiB"` or a plain
/// `"4096"`. Suffixes are case-insensitive and binary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(usize);

impl ByteSize {
    pub const fn new(bytes: usize) -> Self {
        Self(bytes)
    }

    pub const fn bytes(self) -> usize {
        self.0
    }

    pub fn parse(s: &str) -> Result<Self, MemError> {
        let s = s.trim();
        let upper = s.to_ascii_uppercase();
        let (digits, multiplier) = [
            ("GIB", GIB),
            ("GB", GIB),
            ("G", GIB),
            ("MIB", MIB),
            ("MB", MIB),
            ("M", MIB),
            ("KIB", KIB),
            ("KB", KIB),
            ("K", KIB),
            ("B", 1),
        ]
        .into_iter()
        .find(|(suffix, _)| upper.ends_with(suffix))
        .map(|(suffix, multiplier)| (&s[..s.len() - suffix.len()], multiplier))
        .unwrap_or((s, 1));

        let value: usize = digits.trim().parse().map_err(|_| {
            MemError::Config(format!(
                "invalid byte size '{s}', expected a number with an optional K, M or G suffix"
            ))
        })?;
        value
            .checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| MemError::Config(format!("byte size '{s}' overflows")))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => write!(f, "0"),
            n if n % GIB == 0 => write!(f, "{}G", n / GIB),
            n if n % MIB == 0 => write!(f, "{}M", n / MIB),
            n if n % KIB == 0 => write!(f, "{}K", n / KIB),
            n => write!(f, "{n}"),
        }
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0 as u64)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;

        impl<'de> Visitor<'de> for V {
            type Value = ByteSize;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a byte count or a string like \"512M\"")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                usize::try_from(v)
                    .map(ByteSize)
                    .map_err(|_| E::custom("byte size overflows usize"))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                ByteSize::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(V)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagePoolConfig {
    /// How much to reserve up front; `0` takes every free huge page.
    #[serde(default)]
    pub size: ByteSize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Minimum time between two separately kept usage samples
    pub log_granularity_ms: u64,
    /// Serve allocations from huge pages. Off unless present.
    pub page_pool: Option<PagePoolConfig>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            log_granularity_ms: DEFAULT_GRANULARITY.as_millis() as u64,
            page_pool: None,
        }
    }
}

impl MemoryConfig {
    pub fn log_granularity(&self) -> Duration {
        Duration::from_millis(self.log_granularity_ms)
    }

    pub fn from_json(json: &str) -> Result<Self, MemError> {
        serde_json::from_str(json).map_err(|e| MemError::Config(format!("bad JSON config: {e}")))
    }

    /// Defaults, overridden by `BITMEM_LOG_GRANULARITY_MS` and
    /// `BITMEM_PAGE_POOL` when set.
    pub fn from_env() -> Result<Self, MemError> {
        Self::from_lookup(env_var)
    }

    fn from_lookup(
        lookup: impl Fn(&str) -> Result<Option<String>, MemError>,
    ) -> Result<Self, MemError> {
        let mut config = Self::default();
        if let Some(ms) = lookup(ENV_LOG_GRANULARITY_MS)? {
            config.log_granularity_ms = ms.trim().parse().map_err(|_| {
                MemError::Config(format!("{ENV_LOG_GRANULARITY_MS}: '{ms}' is not a number"))
            })?;
        }
        if let Some(size) = lookup(ENV_PAGE_POOL)? {
            config.page_pool = Some(PagePoolConfig {
                size: ByteSize::parse(&size)?,
            });
        }
        Ok(config)
    }
}

/// One variable of the process environment. Only `key` itself has to be
/// valid Unicode.
fn env_var(key: &str) -> Result<Option<String>, MemError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => {
            Err(MemError::Config(format!("{key} is not valid Unicode")))
        }
    }
}
