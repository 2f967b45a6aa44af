use flowcast::config::{
    apply_env_overrides, expand_tilde, resolve_config_path, resolve_database_url, Config, EndpointConfig,
};

#[test]
fn test_default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 8092);
    assert!(cfg.auth.token.is_none());
    assert_eq!(cfg.scheduler.tick_interval_seconds, 30);
    assert_eq!(cfg.sessions.expiry_days, 7);
    assert!(cfg.generator.is_none());
}

#[test]
fn test_default_database_config() {
    let cfg = Config::default();
    assert!(cfg.database.url.is_none());
    assert_eq!(cfg.database.sqlite_path, "~/.flowcast/state.sqlite");
}

#[test]
fn test_default_whatsapp_config() {
    let cfg = Config::default();
    assert_eq!(cfg.whatsapp.sidecar_url, "http://127.0.0.1:4040");
    assert_eq!(cfg.whatsapp.inbound_path, "/v1/channels/whatsapp/inbound");
    assert_eq!(cfg.whatsapp.timeout_seconds, 30);
}

#[test]
fn test_default_integrations_are_off() {
    let cfg = Config::default();
    assert!(cfg.integrations.crm_a.is_none());
    assert!(cfg.integrations.crm_b.is_none());
}

#[test]
fn test_expand_tilde() {
    let expanded = expand_tilde("~/test/path");
    assert!(expanded.to_string_lossy().contains("test/path"));
}

#[test]
fn test_expand_tilde_no_tilde() {
    let expanded = expand_tilde("/absolute/path");
    assert_eq!(expanded.to_string_lossy(), "/absolute/path");
}

#[test]
fn test_resolve_database_url_postgres() {
    let mut cfg = Config::default();
    cfg.database.url = Some("postgres://localhost/testdb".to_string());
    let url = resolve_database_url(&cfg);
    assert_eq!(url, "postgres://localhost/testdb");
}

#[test]
fn test_full_json_config() {
    let raw = r#"{
        "server": {"host": "127.0.0.1", "port": 9000},
        "auth": {"token": "secret"},
        "database": {"url": null, "sqlite_path": "/tmp/flowcast.sqlite"},
        "integrations": {"crm_a": {"url": "http://crm-a", "api_token": "k"}},
        "generator": {"url": "http://gen", "timeout_seconds": 5}
    }"#;
    let cfg: Config = serde_json::from_str(raw).unwrap();
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.auth.token.as_deref(), Some("secret"));
    let crm_a: &EndpointConfig = cfg.integrations.crm_a.as_ref().unwrap();
    assert_eq!(crm_a.timeout_seconds, 20);
    assert_eq!(cfg.generator.as_ref().unwrap().timeout_seconds, 5);
    assert_eq!(cfg.scheduler.sequence_item_delay_ms, 1500);
}

// Environment is process-wide, so everything touching it lives in one test.
#[test]
fn test_env_overrides() {
    std::env::remove_var("FLOWCAST_CONFIG");
    let path = resolve_config_path();
    assert!(path.to_string_lossy().contains(".flowcast"));
    assert!(path.to_string_lossy().ends_with("flowcast.json"));

    std::env::set_var("FLOWCAST_TOKEN", "from-env");
    std::env::set_var("FLOWCAST_TICK_SECONDS", "5");
    std::env::set_var("FLOWCAST_SIDECAR_URL", "  ");
    let mut cfg = Config::default();
    apply_env_overrides(&mut cfg);
    assert_eq!(cfg.auth.token.as_deref(), Some("from-env"));
    assert_eq!(cfg.scheduler.tick_interval_seconds, 5);
    assert_eq!(cfg.whatsapp.sidecar_url, "http://127.0.0.1:4040");

    std::env::remove_var("FLOWCAST_TOKEN");
    std::env::remove_var("FLOWCAST_TICK_SECONDS");
    std::env::remove_var("FLOWCAST_SIDECAR_URL");
}
