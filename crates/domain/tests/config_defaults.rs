use parlor_domain::EngineConfig;

#[test]
fn default_inactivity_is_two_minutes() {
    let config = EngineConfig::default();
    assert_eq!(config.inactivity_secs, 120);
}

#[test]
fn default_dedup_window_is_five_seconds() {
    let config = EngineConfig::default();
    assert_eq!(config.dedup_window_secs, 5);
}

#[test]
fn retry_on_failure_defaults_off() {
    let config = EngineConfig::default();
    assert!(!config.retry_on_failure);
}

#[test]
fn empty_toml_table_parses_to_defaults() {
    let config: EngineConfig = toml::from_str("").unwrap();
    assert_eq!(config.inactivity_secs, 120);
    assert_eq!(config.dedup_window_secs, 5);
    assert!(!config.retry_on_failure);
    assert_eq!(config.default_model, "gpt-4o");
}

#[test]
fn partial_toml_overrides_only_named_fields() {
    let toml_str = r#"
inactivity_secs = 30
retry_on_failure = true
"#;
    let config: EngineConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(config.inactivity_secs, 30);
    assert!(config.retry_on_failure);
    assert_eq!(config.dedup_window_secs, 5);
}
