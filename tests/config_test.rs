use std::fs;

use serde_json::json;

use sipguard::config::AppConfig;
use sipguard::redact::RuleSet;

const TEMPLATE: &str = include_str!("../templates/sipguard.toml");

#[test]
fn template_matches_built_in_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sipguard.toml");
    fs::write(&path, TEMPLATE).unwrap();

    let config = AppConfig::load_from_path(&path).unwrap();
    let defaults = AppConfig::default();
    assert_eq!(config.redaction.rules, defaults.redaction.rules);
    assert_eq!(config.redaction.routes, defaults.redaction.routes);
    assert_eq!(config.server.allowed_hosts, defaults.server.allowed_hosts);
    assert_eq!(config.mitm.config_overrides, defaults.mitm.config_overrides);
    assert_eq!(config.mitm.config_overrides["hidePro"], json!(false));
    assert!(config.validate_mitm().is_ok());
    assert!(config.validate_server().is_err());
}

#[test]
fn local_override_completes_server_settings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sipguard.toml");
    fs::write(&path, TEMPLATE).unwrap();
    unsafe {
        std::env::set_var("SIPGUARD_TEST_SECRET", "s3cret");
    }
    fs::write(
        AppConfig::default_override_path(&path),
        r#"
[server]
secret_key = "${SIPGUARD_TEST_SECRET}"
allowed_hosts = [".hydrate.test"]

[server.auth]
application_id = "app"
client_key = "client"
"#,
    )
    .unwrap();

    let config =
        AppConfig::load_with_override(&path, Some(&AppConfig::default_override_path(&path))).unwrap();
    assert_eq!(config.server.secret_key, "s3cret");
    assert_eq!(config.server.allowed_hosts, vec![".hydrate.test".to_string()]);
    assert_eq!(config.server.auth.session_header, "X-Parse-Session-Token");
    assert_eq!(config.server.database.to_str(), Some("sipguard.db"));
    assert!(config.validate_server().is_ok());
}

#[test]
fn config_overrides_table_replaces_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sipguard.toml");
    fs::write(
        &path,
        r#"
[mitm.config_overrides]
natalModifier = 1.5
"#,
    )
    .unwrap();
    let config = AppConfig::load_from_path(&path).unwrap();
    assert_eq!(config.mitm.config_overrides.len(), 1);
    assert_eq!(config.mitm.config_overrides["natalModifier"], json!(1.5));
    assert!(!config.mitm.blocked_paths.is_empty());
}

#[test]
fn template_rules_drive_redaction() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sipguard.toml");
    fs::write(&path, TEMPLATE).unwrap();
    let config = AppConfig::load_from_path(&path).unwrap();
    let rules = RuleSet::from_config(&config.redaction).unwrap();

    let day = rules.redact(
        "/parse/classes/Day/d1",
        &json!({"totalAmount": 900, "altitude": 120.5, "location": {"objectId": "l1"}, "lat": 1}),
    );
    assert_eq!(day, json!({"totalAmount": 900, "altitude": 0}));

    let install = rules.redact(
        "/parse/classes/_Installation",
        &json!({"deviceType": "android", "timeZone": "UTC"}),
    );
    assert_eq!(install, json!({"deviceType": "a", "timeZone": "UTC"}));
}
