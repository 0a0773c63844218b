//! # Configuration Surface
//!
//! The core never loads configuration itself; the host binary hands it a flat
//! string map and the `ConfigStore` exposes it through a dense, typed key
//! enum. Lookups are lazy and a missing key logs a warning once per key.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

/// Deployment stage the process runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Local development
    Dev,
    /// Pre-production
    Staging,
    /// Production
    Production,
}

impl Stage {
    /// Parse a stage label, defaulting to [`Stage::Dev`] for unknown values.
    pub fn parse(label: &str) -> Self {
        match label {
            "prod" | "production" => Stage::Production,
            "staging" => Stage::Staging,
            _ => Stage::Dev,
        }
    }

    /// Whether this is the production stage.
    pub fn is_production(&self) -> bool {
        matches!(self, Stage::Production)
    }
}

/// Recognised configuration keys, laid out as a dense index.
///
/// The `Count` sentinel closes the enum and sizes the backing array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
#[allow(missing_docs)]
pub enum ConfigKey {
    DatabaseUrl = 0,
    DatabaseMaxConnections,
    DatabaseConnectTimeoutSecs,
    TimeSeriesUrl,
    Stage,
    AdminEmail,
    RateLimitRate,
    RateLimitBurst,
    IdentitySalt,
    EnterpriseLicense,
    SessionCookieName,
    SessionPath,
    SessionMaxLifetimeSecs,
    /// Sentinel; not a real key.
    Count,
}

impl ConfigKey {
    /// External name of the key, as it appears in the host's flat map.
    pub fn name(&self) -> &'static str {
        match self {
            ConfigKey::DatabaseUrl => "database_url",
            ConfigKey::DatabaseMaxConnections => "database_max_connections",
            ConfigKey::DatabaseConnectTimeoutSecs => "database_connect_timeout_secs",
            ConfigKey::TimeSeriesUrl => "timeseries_url",
            ConfigKey::Stage => "stage",
            ConfigKey::AdminEmail => "admin_email",
            ConfigKey::RateLimitRate => "rate_limit_rate",
            ConfigKey::RateLimitBurst => "rate_limit_burst",
            ConfigKey::IdentitySalt => "identity_salt",
            ConfigKey::EnterpriseLicense => "enterprise_license",
            ConfigKey::SessionCookieName => "session_cookie_name",
            ConfigKey::SessionPath => "session_path",
            ConfigKey::SessionMaxLifetimeSecs => "session_max_lifetime_secs",
            ConfigKey::Count => "count",
        }
    }

    /// All real keys, in index order.
    pub fn all() -> impl Iterator<Item = ConfigKey> {
        const KEYS: [ConfigKey; ConfigKey::Count as usize] = [
            ConfigKey::DatabaseUrl,
            ConfigKey::DatabaseMaxConnections,
            ConfigKey::DatabaseConnectTimeoutSecs,
            ConfigKey::TimeSeriesUrl,
            ConfigKey::Stage,
            ConfigKey::AdminEmail,
            ConfigKey::RateLimitRate,
            ConfigKey::RateLimitBurst,
            ConfigKey::IdentitySalt,
            ConfigKey::EnterpriseLicense,
            ConfigKey::SessionCookieName,
            ConfigKey::SessionPath,
            ConfigKey::SessionMaxLifetimeSecs,
        ];
        KEYS.into_iter()
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed read-only view over the host-provided configuration map.
pub struct ConfigStore {
    values: [Option<String>; ConfigKey::Count as usize],
    /// Keys already warned about, so a hot path does not spam the log.
    warned: Mutex<[bool; ConfigKey::Count as usize]>,
}

impl ConfigStore {
    /// Build a store from the host's flat map. Unrecognised entries are ignored.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut values: [Option<String>; ConfigKey::Count as usize] = Default::default();
        for key in ConfigKey::all() {
            values[key as usize] = map.get(key.name()).cloned();
        }
        Self {
            values,
            warned: Mutex::new([false; ConfigKey::Count as usize]),
        }
    }

    /// An empty store; every lookup misses.
    pub fn empty() -> Self {
        Self::from_map(&HashMap::new())
    }

    /// Look up a key, warning once on the first miss.
    pub fn value(&self, key: ConfigKey) -> Option<&str> {
        let v = self.values[key as usize].as_deref();
        if v.is_none() {
            let mut warned = self.warned.lock();
            if !warned[key as usize] {
                warned[key as usize] = true;
                log::warn!("config key '{}' is not set", key);
            }
        }
        v
    }

    /// Look up a key, falling back to a default without warning.
    pub fn value_or<'a>(&'a self, key: ConfigKey, default: &'a str) -> &'a str {
        self.values[key as usize].as_deref().unwrap_or(default)
    }

    /// Look up an integer key. Unparsable values count as missing.
    pub fn int_value(&self, key: ConfigKey) -> Option<i64> {
        self.value(key).and_then(|v| v.parse().ok())
    }

    /// The deployment stage, defaulting to [`Stage::Dev`].
    pub fn stage(&self) -> Stage {
        Stage::parse(self.value_or(ConfigKey::Stage, "dev"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(pairs: &[(&str, &str)]) -> ConfigStore {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConfigStore::from_map(&map)
    }

    #[test]
    fn test_lookup_and_default() {
        let cfg = store(&[("stage", "production"), ("rate_limit_rate", "25")]);
        assert_eq!(cfg.value(ConfigKey::Stage), Some("production"));
        assert_eq!(cfg.int_value(ConfigKey::RateLimitRate), Some(25));
        assert_eq!(cfg.value(ConfigKey::AdminEmail), None);
        assert_eq!(cfg.value_or(ConfigKey::AdminEmail, "ops@example.com"), "ops@example.com");
    }

    #[test]
    fn test_stage_parsing() {
        assert!(store(&[("stage", "prod")]).stage().is_production());
        assert_eq!(store(&[("stage", "weird")]).stage(), Stage::Dev);
        assert_eq!(ConfigStore::empty().stage(), Stage::Dev);
    }

    #[test]
    fn test_unparsable_int_is_none() {
        let cfg = store(&[("rate_limit_burst", "lots")]);
        assert_eq!(cfg.int_value(ConfigKey::RateLimitBurst), None);
    }
}
