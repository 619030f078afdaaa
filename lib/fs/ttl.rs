//! How long the kernel may keep a directory listing.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Kernel list-cache lifetime for directory listings.
///
/// Configured as whole seconds: `0` disables kernel caching, a negative value never expires,
/// anything else is the lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelListCacheTtl {
    /// Every listing is served fresh.
    #[default]
    Disabled,
    /// Listings are reused for this long.
    Ttl(Duration),
    /// Listings are reused until a local change invalidates them.
    Infinite,
}

impl KernelListCacheTtl {
    /// Parse the configured number of seconds.
    #[must_use]
    pub fn from_secs(secs: i64) -> Self {
        match secs {
            0 => Self::Disabled,
            s if s < 0 => Self::Infinite,
            s => Self::Ttl(Duration::from_secs(s.unsigned_abs())),
        }
    }

    /// Inverse of [`from_secs`](Self::from_secs). `Infinite` maps to `-1`.
    #[must_use]
    pub fn as_secs(self) -> i64 {
        match self {
            Self::Disabled => 0,
            Self::Ttl(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
            Self::Infinite => -1,
        }
    }

    /// Whether the kernel may cache listings at all.
    #[must_use]
    pub fn is_enabled(self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Whether a listing served at `listed_at` may still be reused at `now`.
    #[must_use]
    pub fn trusts(self, listed_at: Instant, now: Instant) -> bool {
        match self {
            Self::Disabled => false,
            Self::Infinite => true,
            Self::Ttl(ttl) => now.saturating_duration_since(listed_at) <= ttl,
        }
    }
}

impl fmt::Display for KernelListCacheTtl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::Ttl(d) => write!(f, "{}s", d.as_secs()),
            Self::Infinite => f.write_str("infinite"),
        }
    }
}

impl Serialize for KernelListCacheTtl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_secs())
    }
}

impl<'de> Deserialize<'de> for KernelListCacheTtl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        i64::deserialize(deserializer).map(Self::from_secs)
    }
}
