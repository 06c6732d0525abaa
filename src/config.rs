//! Resolution of the flags and environment variable shared by every verb
//! that drives the coordinator. Parsing argv into this struct is a
//! front-end's job; this module only owns the defaults and the env
//! fallback so every verb resolves them identically.

pub const PROFILE_ENV_VAR: &str = "DISNIX_PROFILE";
const DEFAULT_PROFILE: &str = "default";
const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 2;

#[derive(Debug, Clone)]
pub struct Config {
    pub profile: String,
    pub coordinator_profile_path: Option<String>,
    pub max_concurrent_transfers: usize,
    pub old_manifest: Option<String>,
    pub no_upgrade: bool,
    pub transfer_only: bool,
    pub all_generations: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub profile: Option<String>,
    pub coordinator_profile_path: Option<String>,
    pub max_concurrent_transfers: Option<usize>,
    pub old_manifest: Option<String>,
    pub no_upgrade: bool,
    pub transfer_only: bool,
    pub all_generations: bool,
}

impl Config {
    pub fn resolve(overrides: ConfigOverrides) -> Config {
        Self::resolve_with_env(overrides, |name| std::env::var(name).ok())
    }

    /// Same as [`Config::resolve`] but takes an injectable environment
    /// lookup, so tests can exercise the fallback without mutating real
    /// process environment.
    pub fn resolve_with_env(overrides: ConfigOverrides, env_lookup: impl Fn(&str) -> Option<String>) -> Config {
        let profile = overrides
            .profile
            .or_else(|| env_lookup(PROFILE_ENV_VAR))
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string());

        Config {
            profile,
            coordinator_profile_path: overrides.coordinator_profile_path,
            max_concurrent_transfers: overrides
                .max_concurrent_transfers
                .unwrap_or(DEFAULT_MAX_CONCURRENT_TRANSFERS),
            old_manifest: overrides.old_manifest,
            no_upgrade: overrides.no_upgrade,
            transfer_only: overrides.transfer_only,
            all_generations: overrides.all_generations,
        }
    }
}
