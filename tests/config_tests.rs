//! Configuration loading and validation tests.
//!
//! The env-override test is `#[ignore]` (process-global env vars race in
//! parallel). Run it with:
//! `cargo test --test config_tests -- --ignored --test-threads=1`

use std::fs;

use tempfile::TempDir;

use plancache::config::Config;
use plancache::error::CacheError;

// ============================================================================
// Defaults
// ============================================================================

#[test]
fn test_defaults_without_any_file() {
    let config = Config::default();
    assert_eq!(config.cache.capacity, 2048);
    assert_eq!(config.cache.clone_pool_max, 8);
    assert_eq!(config.eviction.cleanup_interval_secs, 900);
    assert_eq!(config.recompile.check_interval_secs, 600);
    assert_eq!(config.recompile.growth_factor, 8.0);
    assert!(config.validate().is_ok());
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    // Figment treats a missing TOML file as an empty provider.
    let config = Config::from_file("/nonexistent/plancache.toml").expect("load");
    assert_eq!(config.cache.capacity, 2048);
}

// ============================================================================
// File Loading
// ============================================================================

#[test]
fn test_partial_file_overrides_only_named_keys() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("plancache.toml");
    fs::write(
        &path,
        r#"
[cache]
capacity = 64

[recompile]
growth_factor = 4.0
"#,
    )
    .expect("write config");

    let config = Config::from_file(path.to_str().expect("utf8 path")).expect("load");
    assert_eq!(config.cache.capacity, 64);
    assert_eq!(config.recompile.growth_factor, 4.0);
    // Untouched sections keep their defaults.
    assert_eq!(config.cache.clone_pool_max, 8);
    assert_eq!(config.eviction.cleanup_interval_secs, 900);
}

#[test]
fn test_invalid_toml_is_a_config_error() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("plancache.toml");
    fs::write(&path, "[cache\ncapacity = 64").expect("write config");

    let result = Config::from_file(path.to_str().expect("utf8 path"));
    assert!(matches!(result, Err(CacheError::Config(_))));
}

#[test]
fn test_file_with_invalid_values_fails_validation() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("plancache.toml");
    fs::write(
        &path,
        r#"
[cache]
capacity = 0
"#,
    )
    .expect("write config");

    let result = Config::from_file(path.to_str().expect("utf8 path"));
    match result {
        Err(CacheError::Config(message)) => assert!(message.contains("capacity")),
        other => panic!("expected config error, got {other:?}"),
    }
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_ratio_bounds_enforced() {
    let mut config = Config::default();
    config.eviction.overage_ratio = 0.0;
    assert!(config.validate().is_err());
    config.eviction.overage_ratio = 1.0;
    assert!(config.validate().is_ok());

    config.eviction.extra_ratio = -0.1;
    assert!(config.validate().is_err());
    config.eviction.extra_ratio = 1.0;
    assert!(config.validate().is_ok());
}

#[test]
fn test_noise_ceiling_must_be_positive() {
    let mut config = Config::default();
    config.recompile.noise_ceiling = 0;
    assert!(config.validate().is_err());
    config.recompile.noise_ceiling = 1;
    assert!(config.validate().is_ok());
}

// ============================================================================
// Environment Overrides
// ============================================================================

#[test]
#[ignore]
fn test_env_override_beats_file() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("plancache.toml");
    fs::write(&path, "[cache]\ncapacity = 64\n").expect("write config");

    std::env::set_var("PLANCACHE_CACHE__CAPACITY", "128");
    let config = Config::from_file(path.to_str().expect("utf8 path")).expect("load");
    std::env::remove_var("PLANCACHE_CACHE__CAPACITY");

    assert_eq!(config.cache.capacity, 128);
}
