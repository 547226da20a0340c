use berkshelf_api::load_config::load_config;
use berkshelf_api_core::error::ConfigurationError;
use pretty_assertions::assert_eq;
use std::fs::write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

fn config_file(yaml: &str) -> NamedTempFile {
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), yaml).unwrap();
    config_file
}

#[test]
fn test_load_config_full_document() {
    let config_yaml = r#"
home_path: /var/lib/berkshelf-api
host: 127.0.0.1
port: 8080
build_interval_secs: 120
save_snapshots: false
restart:
  max_restarts: 5
  within_secs: 30
endpoints:
  - type: chef_server
    priority: 10
    options:
      url: https://chef.example.com/organizations/acme
      client_name: berkshelf
      client_key: /etc/berkshelf/client.pem
      download_url: https://berks.example.com/cookbooks/{name}/{version}
  - type: gitlab
    options:
      url: https://gitlab.example.com
      group: cookbooks
      download_url: null
"#;
    let file = config_file(config_yaml);
    let config = load_config(file.path()).expect("Config should load");

    assert_eq!(config.home_path, PathBuf::from("/var/lib/berkshelf-api"));
    assert_eq!(config.listen_addr(), "127.0.0.1:8080");
    assert_eq!(config.build_interval_secs, 120);
    assert_eq!(config.worker_timeout_secs, 60);
    assert_eq!(config.save_path(), None);
    assert_eq!(config.restart.max_restarts, 5);
    assert_eq!(config.endpoints.len(), 2);

    let registrations = config.registrations().expect("registrations");
    assert_eq!(registrations[0].worker_type, "chef_server");
    assert_eq!(registrations[0].priority, 10);
    assert_eq!(registrations[1].worker_type, "gitlab");
    assert_eq!(registrations[1].priority, 1);
    assert_eq!(registrations[1].options["download_url"], serde_json::Value::Null);
}

#[test]
fn test_load_config_accepts_json() {
    let file = config_file(
        r#"{"endpoints": [{"type": "gitlab", "options": {"url": "https://gitlab.example.com", "group": "g"}}]}"#,
    );
    let config = load_config(file.path()).expect("JSON is valid YAML");
    assert_eq!(config.port, 26200);
    assert_eq!(config.host, "0.0.0.0");
}

#[test]
fn test_load_config_errors() {
    struct TestCase {
        name: &'static str,
        yaml: &'static str,
        check: fn(&ConfigurationError) -> bool,
    }
    let cases = vec![
        TestCase {
            name: "no endpoints",
            yaml: "port: 1234\n",
            check: |e| matches!(e, ConfigurationError::NoEndpoints),
        },
        TestCase {
            name: "unknown top-level key",
            yaml: "endpoints: []\nsurprise: true\n",
            check: |e| matches!(e, ConfigurationError::Parse(_)),
        },
        TestCase {
            name: "zero interval",
            yaml: "build_interval_secs: 0\nendpoints:\n  - type: gitlab\n",
            check: |e| matches!(e, ConfigurationError::ZeroDuration { field: "build_interval_secs" }),
        },
        TestCase {
            name: "not yaml",
            yaml: "endpoints: [unterminated\n",
            check: |e| matches!(e, ConfigurationError::Parse(_)),
        },
    ];

    for case in cases {
        let file = config_file(case.yaml);
        let err = load_config(file.path()).expect_err(case.name);
        let config_err = err
            .downcast_ref::<ConfigurationError>()
            .unwrap_or_else(|| panic!("{}: not a ConfigurationError: {err}", case.name));
        assert!((case.check)(config_err), "{}: unexpected error {config_err:?}", case.name);
    }
}

#[test]
fn test_load_config_missing_file() {
    let err = load_config("/no/such/dir/config.yml").expect_err("missing file");
    assert!(matches!(
        err.downcast_ref::<ConfigurationError>(),
        Some(ConfigurationError::Read { .. })
    ));
}
