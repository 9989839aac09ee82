use std::time::Duration;

use prioq::{Error, QueueConfig};

// Environment variables are process-global, so every env case lives in
// this one test.
#[test]
fn config_from_env_overrides_and_rejects() {
    unsafe {
        std::env::set_var("PRIOQ_NAME", "controller");
        std::env::set_var("PRIOQ_METRICS_INTERVAL_MS", "250");
        std::env::set_var("PRIOQ_BACKOFF_BASE_MS", " 10 ");
        std::env::remove_var("PRIOQ_LOG_INTERVAL_MS");
        std::env::remove_var("PRIOQ_BACKOFF_MAX_MS");
    }

    let config = QueueConfig::from_env().unwrap();
    assert_eq!(config.name, "controller");
    assert_eq!(config.metrics_update_interval, Duration::from_millis(250));
    assert_eq!(config.backoff_base, Duration::from_millis(10));
    assert_eq!(config.log_interval, Duration::from_secs(5));
    assert_eq!(config.backoff_max, Duration::from_secs(1000));

    unsafe {
        std::env::set_var("PRIOQ_METRICS_INTERVAL_MS", "soon");
    }
    let result = QueueConfig::from_env();
    assert!(matches!(result, Err(Error::Config(_))));

    unsafe {
        std::env::set_var("PRIOQ_METRICS_INTERVAL_MS", "0");
    }
    assert!(QueueConfig::from_env().is_err());

    // Clean up
    unsafe {
        std::env::remove_var("PRIOQ_NAME");
        std::env::remove_var("PRIOQ_METRICS_INTERVAL_MS");
        std::env::remove_var("PRIOQ_BACKOFF_BASE_MS");
    }
    assert_eq!(QueueConfig::from_env().unwrap(), QueueConfig::default());
}

#[test]
fn config_from_toml_keeps_defaults_for_missing_keys() {
    let config = QueueConfig::from_toml_str(
        r#"
        name = "reconciler"
        backoff_max_ms = 30000
        "#,
    )
    .unwrap();

    assert_eq!(config.name, "reconciler");
    assert_eq!(config.backoff_max, Duration::from_secs(30));
    assert_eq!(config.backoff_base, Duration::from_millis(5));
    assert_eq!(config.metrics_update_interval, Duration::from_millis(500));
}

#[test]
fn config_from_empty_toml_is_default() {
    assert_eq!(QueueConfig::from_toml_str("").unwrap(), QueueConfig::default());
}

#[test]
fn config_from_toml_rejects_wrong_types() {
    let result = QueueConfig::from_toml_str("log_interval_ms = \"5s\"");
    assert!(matches!(result, Err(Error::Toml(_))));
}

#[test]
fn config_validation_rejects_unusable_values() {
    let empty_name = QueueConfig::named("");
    assert!(empty_name.validate().is_err());

    let zero_log = QueueConfig {
        log_interval: Duration::ZERO,
        ..QueueConfig::default()
    };
    assert!(zero_log.validate().is_err());

    let inverted = QueueConfig {
        backoff_base: Duration::from_secs(10),
        backoff_max: Duration::from_secs(1),
        ..QueueConfig::default()
    };
    let err = inverted.validate().unwrap_err();
    assert!(err.to_string().contains("backoff"));

    assert!(QueueConfig::from_toml_str("backoff_base_ms = 5000\nbackoff_max_ms = 10").is_err());
}

#[test]
fn config_named_only_changes_the_name() {
    let config = QueueConfig::named("jobs");
    assert_eq!(config.name, "jobs");
    assert_eq!(
        QueueConfig {
            name: "prioq".to_string(),
            ..config
        },
        QueueConfig::default()
    );
}
