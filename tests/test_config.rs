use std::path::PathBuf;
use std::time::Duration;

use hearth::config::{Config, ListenAddr};

#[test]
fn test_config_defaults() {
    let cfg = Config::default();
    assert_eq!(cfg.listen, ListenAddr::Tcp("127.0.0.1:8000".to_string()));
    assert_eq!(cfg.backlog, 4096);
    assert_eq!(cfg.max_content_length, 16 * 1024 * 1024);
    assert_eq!(cfg.client_body_buffer_size, 500 * 1024);
    assert!(cfg.keepalive.enabled);
    assert_eq!(cfg.keepalive_timeout(), Duration::from_secs(5));
    assert_eq!(cfg.read_timeout(), Duration::from_secs(30));
    assert_eq!(cfg.write_timeout(), Duration::from_secs(300));
    assert_eq!(cfg.server_name, "hearth");
}

#[test]
fn test_config_from_partial_yaml() {
    let cfg = Config::from_yaml(
        "listen: 0.0.0.0:3000\n\
         max_content_length: 1024\n\
         keepalive:\n  timeout_secs: 15\n\
         server_name: edge\n",
    )
    .unwrap();
    assert_eq!(cfg.listen, ListenAddr::Tcp("0.0.0.0:3000".to_string()));
    assert_eq!(cfg.max_content_length, 1024);
    assert!(cfg.keepalive.enabled);
    assert_eq!(cfg.keepalive.timeout_secs, 15);
    assert_eq!(cfg.server_name, "edge");
    assert_eq!(cfg.backlog, 4096);
}

#[test]
fn test_config_unix_listen_address() {
    let cfg = Config::from_yaml("listen: unix:/tmp/hearth.sock\n").unwrap();
    assert_eq!(cfg.listen, ListenAddr::Unix(PathBuf::from("/tmp/hearth.sock")));
    assert_eq!(cfg.listen.to_string(), "unix:/tmp/hearth.sock");
    assert_eq!(ListenAddr::from("/run/app.sock"), ListenAddr::Unix(PathBuf::from("/run/app.sock")));
}

#[test]
fn test_config_rejects_invalid_values() {
    assert!(Config::from_yaml("max_connections: 0\n").is_err());
    assert!(Config::from_yaml("task_stack_size: 1024\n").is_err());
    assert!(Config::from_yaml("backlog: lots\n").is_err());
}

#[test]
fn test_config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hearth.yaml");
    std::fs::write(&path, "read_timeout_secs: 7\naccess_log: false\n").unwrap();
    let cfg = Config::from_file(&path).unwrap();
    assert_eq!(cfg.read_timeout(), Duration::from_secs(7));
    assert!(!cfg.access_log);

    let missing = Config::from_file(&dir.path().join("missing.yaml")).unwrap_err();
    assert!(missing.to_string().contains("missing.yaml"));
}

#[test]
fn test_config_environment_overrides() {
    unsafe {
        std::env::remove_var("HEARTH_CONFIG");
        std::env::set_var("LISTEN", "0.0.0.0:5000");
    }
    let cfg = Config::load().unwrap();
    assert_eq!(cfg.listen, ListenAddr::Tcp("0.0.0.0:5000".to_string()));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hearth.yaml");
    std::fs::write(&path, "listen: 127.0.0.1:9000\nbacklog: 16\n").unwrap();
    unsafe {
        std::env::set_var("HEARTH_CONFIG", &path);
        std::env::remove_var("LISTEN");
    }
    let cfg = Config::load().unwrap();
    assert_eq!(cfg.listen, ListenAddr::Tcp("127.0.0.1:9000".to_string()));
    assert_eq!(cfg.backlog, 16);

    unsafe {
        std::env::remove_var("HEARTH_CONFIG");
    }
}
