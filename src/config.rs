/// Configuration (SPEC_FULL.md §6) — process-wide settings loaded exactly
/// the way the teacher's `config.rs` does it: a `config::Config` built from
/// a `config.toml` file source, exposed through a process-wide
/// `once_cell::sync::OnceCell`, with a `load_config()` escape hatch for
/// standalone tools/tests that should not touch global state.
pub use config::Config;
pub use once_cell::sync::OnceCell;
use std::error::Error;
use std::time::Duration;

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

pub fn init_global_config() -> Result<(), Box<dyn Error>> {
    let config = Config::builder()
        .add_source(config::File::with_name("config.toml"))
        .build()?;
    GLOBAL_CONFIG.set(config).map_err(|_| "config already set")?;
    Ok(())
}

pub fn get_global_config() -> &'static Config {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

/// Load config for standalone binaries/utilities without touching global state.
pub fn load_config() -> Result<Config, Box<dyn Error>> {
    load_config_from(std::path::Path::new("config.toml"))
}

/// Same as `load_config`, but from an explicit path — lets tests point at a
/// `tempfile::TempDir` fixture without mutating the process's current
/// directory (which is shared, unsynchronized, global state under a
/// parallel test runner).
pub fn load_config_from(path: &std::path::Path) -> Result<Config, Box<dyn Error>> {
    Config::builder()
        .add_source(config::File::from(path))
        .build()
        .map_err(|e| Box::new(e) as Box<dyn Error>)
}

/// Resolves the capacity/watermark table named throughout §4. `LocalDev`
/// widens every buffer and defaults to `ephemeral` so a laptop run never
/// blocks on, or backs up behind, a real store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Default,
    LocalDev,
}

impl Profile {
    fn from_str(s: &str) -> Profile {
        match s {
            "local_dev" | "localdev" | "local-dev" => Profile::LocalDev,
            _ => Profile::Default,
        }
    }

    pub fn sequencer_high_water(self) -> usize {
        match self {
            Profile::Default => 2_000,
            Profile::LocalDev => 800,
        }
    }

    pub fn sequencer_low_water(self) -> usize {
        200
    }

    pub fn sequencer_hard_cap(self) -> usize {
        match self {
            Profile::Default => 1_000,
            Profile::LocalDev => 50_000,
        }
    }
}

/// Typed, resolved settings for one process, assembled from `config.toml`
/// (or defaults, for any key absent) per the table in §6. Each component's
/// own `*Config` struct is built from a slice of this, so this is the only
/// place `config::Config`'s stringly-typed accessors are read.
pub struct IndexerConfig {
    pub chain_id: u64,
    pub start_anchor: u64,
    pub profile: Profile,
    pub ephemeral: bool,
    pub header_only: bool,

    pub fetcher_concurrency: usize,
    pub fetcher_range_step: u64,

    pub sequencer_batch_size: usize,
    pub sequencer_buffer_cap: usize,

    pub checkpoint_batch: u64,

    pub async_writer_capacity: usize,
    pub async_writer_batch_size: usize,
    pub async_writer_flush_interval: Duration,

    pub safety_buffer_initial: u32,

    pub watchdog_gap_threshold: u64,
    pub watchdog_stall_threshold: Duration,
}

impl IndexerConfig {
    /// Read every key through typed accessors with code-level defaults,
    /// matching `get_global_config().get_int("sync.parallel_files").unwrap_or(8)`
    /// in the teacher's `sync.rs`.
    pub fn from_config(config: &Config) -> Self {
        let profile = Profile::from_str(
            &config
                .get_string("profile")
                .unwrap_or_else(|_| "default".into()),
        );
        Self {
            chain_id: config.get_int("chain_id").map(|v| v as u64).unwrap_or(1),
            start_anchor: config.get_int("start_anchor").map(|v| v as u64).unwrap_or(0),
            profile,
            ephemeral: config
                .get_bool("ephemeral")
                .unwrap_or(profile == Profile::LocalDev),
            header_only: config.get_bool("header_only").unwrap_or(false),
            fetcher_concurrency: config
                .get_int("fetcher.concurrency")
                .map(|v| v as usize)
                .unwrap_or(4),
            fetcher_range_step: config
                .get_int("fetcher.range_step")
                .map(|v| v as u64)
                .unwrap_or(50),
            sequencer_batch_size: config
                .get_int("batch_size")
                .map(|v| v as usize)
                .unwrap_or(100),
            sequencer_buffer_cap: config
                .get_int("sequencer.hard_cap")
                .map(|v| v as usize)
                .unwrap_or_else(|_| profile.sequencer_hard_cap()),
            checkpoint_batch: config
                .get_int("checkpoint_batch")
                .map(|v| v as u64)
                .unwrap_or(100),
            async_writer_capacity: config
                .get_int("async_writer.capacity")
                .map(|v| v as usize)
                .unwrap_or(15_000),
            async_writer_batch_size: config
                .get_int("async_writer.batch_size")
                .map(|v| v as usize)
                .unwrap_or(200),
            async_writer_flush_interval: Duration::from_millis(
                config
                    .get_int("flush_interval_ms")
                    .map(|v| v as u64)
                    .unwrap_or(500),
            ),
            safety_buffer_initial: config
                .get_int("safety_buffer.initial")
                .map(|v| v as u32)
                .unwrap_or(1),
            watchdog_gap_threshold: config
                .get_int("watchdog.gap_threshold")
                .map(|v| v as u64)
                .unwrap_or(1_000),
            watchdog_stall_threshold: Duration::from_secs(
                config
                    .get_int("watchdog.stall_threshold_secs")
                    .map(|v| v as u64)
                    .unwrap_or(120),
            ),
        }
    }

    /// Resolve straight from the global config singleton.
    pub fn from_global_config() -> Self {
        Self::from_config(get_global_config())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, body: &str) {
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn defaults_apply_when_keys_are_absent() {
        let dir = tempfile::tempdir().unwrap();
        write_config(&dir, "chain_id = 1\n");
        let config = load_config_from(&dir.path().join("config.toml")).unwrap();
        let resolved = IndexerConfig::from_config(&config);

        assert_eq!(resolved.chain_id, 1);
        assert_eq!(resolved.fetcher_concurrency, 4);
        assert_eq!(resolved.async_writer_capacity, 15_000);
        assert_eq!(resolved.profile, Profile::Default);
    }

    #[test]
    fn local_dev_profile_widens_buffers_and_enables_ephemeral() {
        let dir = tempfile::tempdir().unwrap();
        write_config(&dir, "profile = \"local_dev\"\n");
        let config = load_config_from(&dir.path().join("config.toml")).unwrap();
        let resolved = IndexerConfig::from_config(&config);

        assert_eq!(resolved.profile, Profile::LocalDev);
        assert!(resolved.ephemeral);
        assert_eq!(resolved.sequencer_buffer_cap, 50_000);
    }

    #[test]
    fn explicit_keys_override_profile_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_config(&dir, "profile = \"local_dev\"\nephemeral = false\n");
        let config = load_config_from(&dir.path().join("config.toml")).unwrap();
        let resolved = IndexerConfig::from_config(&config);

        assert!(!resolved.ephemeral);
    }
}
