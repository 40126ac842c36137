use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{descriptors::Partition, HeapKind};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerPreference {
    #[default]
    LowPower,
    HighPerformance,
}

/// Sizing of the descriptors of one kind.
///
/// Fields left out of a `[descriptors.<kind>]` table keep that kind's
/// defaults from [`DescriptorConfig::default`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Total number of descriptors in the heap.
    pub capacity: u32,

    /// Number of equally sized transient pages. Only meaningful for
    /// shader-visible kinds; each command context holds one page at a time.
    pub page_count: u32,

    /// Minimum size of the static region. Whatever cannot be evenly divided
    /// between the pages is added to it.
    pub static_size: u32,

    /// Size of the CPU-only heap that copy sources are staged in. Zero
    /// disables it.
    pub staging_capacity: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DescriptorOverrides")]
pub struct DescriptorConfig {
    pub cbv_srv_uav: HeapConfig,
    pub sampler: HeapConfig,
    pub rtv: HeapConfig,
    pub dsv: HeapConfig,
}

impl DescriptorConfig {
    #[must_use]
    pub fn get(&self, kind: HeapKind) -> &HeapConfig {
        match kind {
            HeapKind::CbvSrvUav => &self.cbv_srv_uav,
            HeapKind::Sampler => &self.sampler,
            HeapKind::Rtv => &self.rtv,
            HeapKind::Dsv => &self.dsv,
        }
    }
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            cbv_srv_uav: HeapConfig {
                capacity: 4096,
                page_count: 8,
                static_size: 1024,
                staging_capacity: 1024,
            },
            sampler: HeapConfig {
                capacity: 256,
                page_count: 4,
                static_size: 64,
                staging_capacity: 64,
            },
            rtv: HeapConfig {
                capacity: 64,
                page_count: 0,
                static_size: 64,
                staging_capacity: 0,
            },
            dsv: HeapConfig {
                capacity: 16,
                page_count: 0,
                static_size: 16,
                staging_capacity: 0,
            },
        }
    }
}

/// The fields of one `[descriptors.<kind>]` table that were given.
#[derive(Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct HeapOverrides {
    capacity: Option<u32>,
    page_count: Option<u32>,
    static_size: Option<u32>,
    staging_capacity: Option<u32>,
}

impl HeapOverrides {
    fn apply(self, defaults: HeapConfig) -> HeapConfig {
        HeapConfig {
            capacity: self.capacity.unwrap_or(defaults.capacity),
            page_count: self.page_count.unwrap_or(defaults.page_count),
            static_size: self.static_size.unwrap_or(defaults.static_size),
            staging_capacity: self.staging_capacity.unwrap_or(defaults.staging_capacity),
        }
    }
}

#[derive(Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DescriptorOverrides {
    cbv_srv_uav: HeapOverrides,
    sampler: HeapOverrides,
    rtv: HeapOverrides,
    dsv: HeapOverrides,
}

impl From<DescriptorOverrides> for DescriptorConfig {
    fn from(overrides: DescriptorOverrides) -> Self {
        let defaults = Self::default();
        Self {
            cbv_srv_uav: overrides.cbv_srv_uav.apply(defaults.cbv_srv_uav),
            sampler: overrides.sampler.apply(defaults.sampler),
            rtv: overrides.rtv.apply(defaults.rtv),
            dsv: overrides.dsv.apply(defaults.dsv),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The power preference for adapter selection.
    ///
    /// `LowPower` prefers integrated GPUs over discrete GPUs in multi-gpu
    /// systems, and `HighPerformance` does the reverse. Defaults to
    /// `LowPower`.
    pub power_preference: PowerPreference,

    /// Whether or not to enable debugging features.
    ///
    /// Defaults to `None`, which enables debugging features in debug builds.
    /// Override with `Some(true)` or `Some(false)` to force enable or disable
    /// debugging.
    pub debug_mode: Option<bool>,

    /// How many frames the CPU may record ahead of the GPU. Defaults to 2.
    pub frames_in_flight: u32,

    /// Number of command contexts in the pool. Defaults to `None`, which
    /// means `frames_in_flight + 1`: one context per frame the GPU may be
    /// working on, plus the one being recorded.
    pub context_pool_size: Option<u32>,

    pub descriptors: DescriptorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            power_preference: PowerPreference::LowPower,
            debug_mode: None,
            frames_in_flight: 2,
            context_pool_size: None,
            descriptors: DescriptorConfig::default(),
        }
    }
}

impl Config {
    /// Parses a configuration from TOML. Missing fields take their default
    /// values.
    ///
    /// ## Errors
    ///
    /// Fails if the text is not valid TOML or does not pass [`Self::validate`].
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML configuration file.
    ///
    /// ## Errors
    ///
    /// Fails if the file cannot be read or parsed, or is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        log::debug!("loading configuration from {}", path.display());
        Self::from_toml_str(&text)
    }

    /// ## Errors
    ///
    /// Fails if the configuration cannot be represented as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    #[must_use]
    pub fn enable_debug(&self) -> bool {
        self.debug_mode.unwrap_or(cfg!(debug_assertions))
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        let size = self
            .context_pool_size
            .unwrap_or_else(|| self.frames_in_flight.saturating_add(1));
        size as usize
    }

    /// Checks that the configuration describes something that can be built.
    ///
    /// Too few transient pages for the pool is allowed, but logged: context
    /// acquisition then waits for a submission to return its page even when
    /// a context is free.
    ///
    /// ## Errors
    ///
    /// Fails if the pool is empty or a static region exceeds its heap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool_size = self.pool_size();
        if pool_size == 0 {
            return Err(ConfigError::Invalid(
                "the command context pool must hold at least one context".into(),
            ));
        }

        for kind in HeapKind::ALL {
            let heap = self.descriptors.get(kind);
            let partition = Partition::new(heap.capacity, heap.page_count, heap.static_size)
                .map_err(|e| ConfigError::Invalid(format!("{kind:?}: {e}")))?;

            if kind.is_shader_visible() && (heap.page_count as usize) < pool_size {
                log::warn!(
                    "{kind:?}: {} transient pages for {pool_size} command contexts",
                    heap.page_count
                );
            }

            if partition.page_count > 0 && partition.page_size == 0 {
                log::warn!("{kind:?}: transient pages are empty");
            }

            if !kind.is_shader_visible() && heap.page_count > 0 {
                log::warn!("{kind:?}: transient pages are never checked out for this kind");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.pool_size(), 3);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            frames_in_flight = 3
            power_preference = "high-performance"

            [descriptors.sampler]
            capacity = 512
            page_count = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.pool_size(), 4);
        assert_eq!(config.power_preference, PowerPreference::HighPerformance);
        assert_eq!(config.descriptors.sampler.capacity, 512);
        assert_eq!(config.descriptors.sampler.page_count, 8);
        assert_eq!(config.descriptors.cbv_srv_uav, DescriptorConfig::default().cbv_srv_uav);
    }

    #[test]
    fn partial_heap_tables_keep_the_kind_defaults() {
        let config = Config::from_toml_str(
            r#"
            [descriptors.sampler]
            page_count = 2
            "#,
        )
        .unwrap();

        let defaults = DescriptorConfig::default().sampler;
        let sampler = config.descriptors.sampler;
        assert_eq!(sampler.page_count, 2);
        assert_eq!(sampler.capacity, defaults.capacity);
        assert_eq!(sampler.static_size, defaults.static_size);
        assert_eq!(sampler.staging_capacity, defaults.staging_capacity);

        assert!(matches!(
            Config::from_toml_str("[descriptors.sampler]\npages = 2"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        assert!(matches!(
            Config::from_toml_str("context_pool_size = 0"),
            Err(ConfigError::Invalid(_))
        ));

        assert!(matches!(
            Config::from_toml_str(
                r#"
                [descriptors.rtv]
                capacity = 4
                static_size = 8
                "#
            ),
            Err(ConfigError::Invalid(_))
        ));

        assert!(matches!(
            Config::from_toml_str("frames_in_flight = \"two\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config {
            context_pool_size: Some(5),
            debug_mode: Some(false),
            ..Config::default()
        };

        let text = config.to_toml_string().unwrap();
        assert_eq!(Config::from_toml_str(&text).unwrap(), config);
    }
}
