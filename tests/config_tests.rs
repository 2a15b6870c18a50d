// Configuration tests: defaults, file loading, env expansion, validation.

use std::fs;

use uplink_relay::Config;

#[test]
fn test_default_values() {
    let config = Config::default();

    assert_eq!(config.relay.address, "localhost:8080");
    assert_eq!(config.relay.public_url, "");
    assert_eq!(config.uplink.urls, vec!["http://localhost:8081"]);
    assert_eq!(config.uplink.timeout, 30);
    assert_eq!(config.uplink.retry_count, 1);
    assert_eq!(
        config.uplink.studio_api_url,
        "https://graphql.api.apollographql.com/api/graphql"
    );

    assert!(config.cache.enabled);
    assert_eq!(config.cache.duration, -1);
    assert_eq!(config.cache.max_size, 1000);

    assert!(!config.redis.enabled);
    assert!(!config.filesystem.enabled);
    assert!(config.supergraphs.is_empty());

    assert!(!config.webhook.enabled);
    assert_eq!(config.webhook.path, "/webhook");

    assert!(!config.polling.enabled);
    assert!(config.polling.supergraph);
    assert!(config.polling.entitlements);
    assert!(!config.polling.persisted_queries);
    assert_eq!(config.polling.retry_count, 1);

    assert!(!config.management_api.enabled);
    assert_eq!(config.management_api.path, "/graphql");
}

#[test]
fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yml");
    fs::write(
        &path,
        r#"
relay:
  address: "0.0.0.0:4000"
  publicURL: "http://relay.internal:4000"
uplink:
  urls:
    - "https://uplink.example.com"
    - "https://aws.uplink.example.com"
  timeout: 10
  retryCount: 3
cache:
  enabled: true
  duration: 90
  maxSize: 250
supergraphs:
  - graphRef: "acme@prod"
    apolloKey: "service:acme:key"
    launchID: "launch-1"
polling:
  enabled: true
  interval: 30
  retryCount: 2
  persistedQueries: true
"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.relay.address, "0.0.0.0:4000");
    assert_eq!(config.relay.public_url, "http://relay.internal:4000");
    assert_eq!(config.uplink.urls.len(), 2);
    assert_eq!(config.uplink.timeout, 10);
    assert_eq!(config.uplink.retry_count, 3);
    assert_eq!(config.cache.duration, 90);
    assert_eq!(config.cache.max_size, 250);
    assert_eq!(config.supergraphs.len(), 1);
    assert_eq!(config.supergraphs[0].graph_ref, "acme@prod");
    assert_eq!(config.supergraphs[0].launch_id, "launch-1");
    assert!(config.polling.enabled);
    assert_eq!(config.polling.interval, 30);
    assert!(config.polling.persisted_queries);
    // Untouched sections keep their defaults.
    assert_eq!(
        config.uplink.studio_api_url,
        "https://graphql.api.apollographql.com/api/graphql"
    );
    assert!(config.validate().is_ok());
}

#[test]
fn test_load_expands_environment_variables() {
    std::env::set_var("UPLINK_RELAY_TEST_KEY", "service:acme:secret");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yml");
    fs::write(
        &path,
        r#"
supergraphs:
  - graphRef: "acme@prod"
    apolloKey: "${UPLINK_RELAY_TEST_KEY}"
"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.supergraphs[0].apollo_key, "service:acme:secret");
}

#[test]
fn test_load_missing_file_fails() {
    assert!(Config::load("/nonexistent/config.yml").is_err());
}

#[test]
fn test_load_invalid_yaml_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yml");
    fs::write(&path, "relay: [[[").unwrap();
    assert!(Config::load(&path).is_err());
}

#[test]
fn test_validate_rejects_empty_address() {
    let mut config = Config::default();
    config.relay.address = String::new();
    assert!(config.validate().is_err());
}

#[test]
fn test_validate_rejects_bad_public_url_scheme() {
    let mut config = Config::default();
    config.relay.public_url = "ftp://relay.internal".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_validate_rejects_empty_uplink_urls() {
    let mut config = Config::default();
    config.uplink.urls.clear();
    assert!(config.validate().is_err());
}

#[test]
fn test_validate_rejects_zero_retry_count() {
    let mut config = Config::default();
    config.uplink.retry_count = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_validate_rejects_zero_cache_duration() {
    let mut config = Config::default();
    config.cache.duration = 0;
    assert!(config.validate().is_err());

    config.cache.duration = -1;
    assert!(config.validate().is_ok());
}

#[test]
fn test_validate_rejects_zero_cache_size() {
    let mut config = Config::default();
    config.cache.max_size = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_validate_rejects_interval_and_cron_together() {
    let mut config = Config::default();
    config.polling.enabled = true;
    config.polling.interval = 30;
    config.polling.cron_expressions = vec!["0 * * * * *".to_string()];
    assert!(config.validate().is_err());
}

#[test]
fn test_validate_rejects_polling_without_schedule() {
    let mut config = Config::default();
    config.polling.enabled = true;
    assert!(config.validate().is_err());
}

#[test]
fn test_validate_rejects_invalid_cron_expression() {
    let mut config = Config::default();
    config.polling.enabled = true;
    config.polling.cron_expressions = vec!["not a cron".to_string()];
    assert!(config.validate().is_err());
}

#[test]
fn test_validate_accepts_cron_expressions() {
    let mut config = Config::default();
    config.polling.enabled = true;
    config.polling.cron_expressions = vec!["0 */5 * * * *".to_string()];
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_json_schema_lists_sections() {
    let schema = uplink_relay::config::config_json_schema().unwrap();
    assert!(schema.contains("relay"));
    assert!(schema.contains("uplink"));
    assert!(schema.contains("supergraphs"));
    assert!(schema.contains("managementAPI"));
}

#[test]
fn test_shared_config_replacement_is_visible_to_new_readers() {
    use uplink_relay::SharedConfig;

    let shared = SharedConfig::new(Config::default());
    let before = shared.current();

    let mut raised = Config::default();
    raised.cache.max_size = 100;
    shared.store(raised);

    // The old handle keeps its snapshot; new reads see the replacement.
    assert_eq!(before.cache.max_size, 1000);
    assert_eq!(shared.current().cache.max_size, 100);
}

#[test]
fn test_shared_config_records_pinned_selector() {
    use uplink_relay::{SharedConfig, SupergraphConfig};

    let mut config = Config::default();
    config.supergraphs = vec![SupergraphConfig {
        graph_ref: "acme@prod".to_string(),
        ..SupergraphConfig::default()
    }];
    let shared = SharedConfig::new(config);

    shared.update_supergraph("acme@prod", |supergraph| {
        supergraph.launch_id = "L9".to_string();
    });
    assert_eq!(shared.current().supergraphs[0].launch_id, "L9");
}

#[test]
fn test_find_supergraph() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yml");
    fs::write(
        &path,
        r#"
supergraphs:
  - graphRef: "acme@prod"
    apolloKey: "key"
"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert!(config.find_supergraph("acme@prod").is_some());
    assert!(config.find_supergraph("other@prod").is_none());
}
