use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use cascade_runtime::config::DaemonConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CASCADE_CONFIG",
        "CASCADE_API_ADDR",
        "CASCADE_FILES",
        "CASCADE_MQTT_BROKER",
        "CASCADE_BLOB_URL",
        "CASCADE_BLOB_DIR",
        "CASCADE_INFERENCE_URL",
        "CASCADE_INSTANCE_ID",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "api": { "addr": "127.0.0.1:9100" },
        "cascades": ["lobby.json", "dock.toml"],
        "mqtt": {
            "broker": "mqtt://broker.local:1883",
            "client_id": "edge-7",
            "username": "edge",
            "password": "secret",
            "topic": "skills/lobby"
        },
        "blob": { "local_dir": "/var/lib/cascade/snippets" },
        "inference": { "endpoint": "http://127.0.0.1:7000/score", "timeout_ms": 1500 },
        "identity": { "instance_id": "inst-1", "skill_id": "people", "device_id": "cam-3" }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("CASCADE_CONFIG", file.path());
    std::env::set_var("CASCADE_FILES", "a.json, b.json");
    std::env::set_var("CASCADE_INSTANCE_ID", "inst-2");

    let cfg = DaemonConfig::load().expect("load config");

    assert_eq!(cfg.api_addr, "127.0.0.1:9100");
    assert_eq!(cfg.cascades, vec![PathBuf::from("a.json"), PathBuf::from("b.json")]);
    let mqtt = cfg.mqtt.expect("mqtt");
    assert_eq!(mqtt.settings.broker, "mqtt://broker.local:1883");
    assert_eq!(mqtt.settings.client_id, "edge-7");
    assert_eq!(mqtt.settings.username.as_deref(), Some("edge"));
    assert_eq!(mqtt.topic, "skills/lobby");
    assert_eq!(
        cfg.blob.local_dir,
        Some(PathBuf::from("/var/lib/cascade/snippets"))
    );
    assert!(cfg.blob.container_url.is_none());
    let inference = cfg.inference.expect("inference");
    assert_eq!(inference.endpoint, "http://127.0.0.1:7000/score");
    assert_eq!(inference.timeout, Duration::from_millis(1500));
    assert_eq!(cfg.identity.instance_id, "inst-2");
    assert_eq!(cfg.identity.skill_id, "people");

    clear_env();
}

#[test]
fn env_alone_is_enough() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CASCADE_API_ADDR", "127.0.0.1:0");
    std::env::set_var("CASCADE_MQTT_BROKER", "127.0.0.1:1883");
    std::env::set_var("CASCADE_BLOB_URL", "https://acct.blob.example/snippets");
    std::env::set_var("CASCADE_INFERENCE_URL", "http://127.0.0.1:7000/score");

    let cfg = DaemonConfig::load().expect("load config");
    assert_eq!(cfg.api_addr, "127.0.0.1:0");
    assert_eq!(cfg.mqtt.expect("mqtt").topic, "mqttmessage");
    assert_eq!(
        cfg.blob.container_url.as_deref(),
        Some("https://acct.blob.example/snippets")
    );
    assert!(cfg.inference.is_some());
    assert!(cfg.cascades.is_empty());

    clear_env();
}

#[test]
fn toml_config_and_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("cascaded.toml");
    std::fs::write(
        &path,
        r#"
cascades = ["one.json"]

[api]
addr = "127.0.0.1:9200"
"#,
    )
    .expect("write");
    let cfg = DaemonConfig::load_from(Some(&path)).expect("toml config");
    assert_eq!(cfg.api_addr, "127.0.0.1:9200");
    assert_eq!(cfg.cascades, vec![PathBuf::from("one.json")]);

    std::env::set_var("CASCADE_API_ADDR", "not-an-address");
    assert!(DaemonConfig::load_from(Some(&path)).is_err());
    clear_env();

    std::env::set_var("CASCADE_MQTT_BROKER", "ftp://broker");
    assert!(DaemonConfig::load().is_err());

    clear_env();
}

#[test]
fn cascade_files_are_loaded_relative_to_given_paths() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("tempdir");
    let cascade = dir.path().join("lobby.json");
    std::fs::write(
        &cascade,
        r#"{"nodes":[{"id":"cam","type":"source","name":"synthetic"}],"edges":[]}"#,
    )
    .expect("write");
    std::env::set_var("CASCADE_FILES", cascade.display().to_string());

    let cfg = DaemonConfig::load().expect("load");
    let cascades = cfg.load_cascades().expect("cascades");
    assert_eq!(cascades.len(), 1);
    assert_eq!(cascades[0].name, "lobby");

    clear_env();
}
