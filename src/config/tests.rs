use super::*;
use serial_test::serial;
use std::io::Write;

#[test]
fn test_relay_config_default() {
    let config = RelayConfig::default();
    assert_eq!(config.store.host, "127.0.0.1");
    assert_eq!(config.store.port, 5432);
    assert_eq!(config.store.database, "socketio_relay");
    assert_eq!(config.store.table, "messages");
    assert!(!config.save_messages);
    assert_eq!(config.durability, Durability::Soft);
    assert_eq!(config.key_prefix, "socket.io");
    assert_eq!(config.namespaces, vec!["/".to_string()]);
}

#[test]
fn test_apply_uri_host_and_port() {
    let mut store = StoreConfig::default();
    store.apply_uri("db.internal:6000").unwrap();
    assert_eq!(store.host, "db.internal");
    assert_eq!(store.port, 6000);
}

#[test]
fn test_apply_uri_host_only_keeps_port() {
    let mut store = StoreConfig::default();
    store.apply_uri("db.internal").unwrap();
    assert_eq!(store.host, "db.internal");
    assert_eq!(store.port, DEFAULT_PORT);
}

#[test]
fn test_apply_uri_rejects_bad_input() {
    let mut store = StoreConfig::default();
    assert!(matches!(
        store.apply_uri("db:notaport"),
        Err(ConfigError::InvalidPort(_))
    ));
    assert!(matches!(
        store.apply_uri(":5432"),
        Err(ConfigError::InvalidUri(_))
    ));
    assert!(matches!(
        store.apply_uri("a:1:2"),
        Err(ConfigError::InvalidUri(_))
    ));
    assert_eq!(store.host, DEFAULT_HOST);
}

#[test]
fn test_apply_uri_failure_leaves_config_unchanged() {
    let mut store = StoreConfig::default();
    for uri in ["db:", "db:70000", "other:-1"] {
        assert!(matches!(
            store.apply_uri(uri),
            Err(ConfigError::InvalidPort(_))
        ));
        assert_eq!(store.host, DEFAULT_HOST);
        assert_eq!(store.port, DEFAULT_PORT);
    }
}

#[test]
#[serial]
fn test_load_from_file() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        "store:\n  host: pg.example\n  port: 6543\n  table: relay\nsave_messages: true\ndurability: hard\nnamespaces: [\"/\", \"/chat\"]"
    )
    .unwrap();

    let config = RelayConfig::load(Some(file.path().to_str().unwrap())).unwrap();

    assert_eq!(config.store.host, "pg.example");
    assert_eq!(config.store.port, 6543);
    assert_eq!(config.store.table, "relay");
    assert_eq!(config.store.database, DEFAULT_DATABASE);
    assert!(config.save_messages);
    assert_eq!(config.durability, Durability::Hard);
    assert_eq!(config.namespaces, vec!["/".to_string(), "/chat".to_string()]);
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(file, "store:\n  host: pg.example\nsave_messages: false").unwrap();

    std::env::set_var("RELAY__STORE__HOST", "pg.override");
    std::env::set_var("RELAY__SAVE_MESSAGES", "true");
    let result = RelayConfig::load(Some(file.path().to_str().unwrap()));
    std::env::remove_var("RELAY__STORE__HOST");
    std::env::remove_var("RELAY__SAVE_MESSAGES");

    let config = result.unwrap();
    assert_eq!(config.store.host, "pg.override");
    assert!(config.save_messages);
}

#[test]
#[serial]
fn test_load_missing_required_file_fails() {
    let result = RelayConfig::load(Some("/nonexistent/relay-config.yaml"));
    assert!(matches!(result, Err(ConfigError::Load(_))));
}
