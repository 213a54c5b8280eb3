use std::io::Write;

use super::*;

fn write_toml(contents: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    f
}

#[test]
fn loads_with_defaults_for_omitted_fields() {
    let f = write_toml(
        r#"
        root_dn = "dc=example,dc=com"
        repl_id = 1
        repl_type = "read-write"
        replica_generation = "deadbeef000100000000"
        "#,
    );
    let cfg = ReplicaConfig::load(f.path()).unwrap();
    assert_eq!(cfg.root_dn, "dc=example,dc=com");
    assert_eq!(cfg.repl_id, Rid::new(1));
    assert_eq!(cfg.repl_type, ReplicaType::ReadWrite);
    assert_eq!(cfg.purge_delay, crate::protocol::DEFAULT_PURGE_DELAY);
    assert_eq!(cfg.backoff_min, crate::protocol::PROTOCOL_BACKOFF_MINIMUM);
}

#[test]
fn rejects_unknown_repl_type() {
    let f = write_toml(
        r#"
        root_dn = "dc=example,dc=com"
        repl_id = 1
        repl_type = "bogus"
        replica_generation = "deadbeef000100000000"
        "#,
    );
    assert!(matches!(
        ReplicaConfig::load(f.path()),
        Err(ConfigError::BadReplicaType(_))
    ));
}

#[test]
fn rejects_inverted_backoff_range() {
    let f = write_toml(
        r#"
        root_dn = "dc=example,dc=com"
        repl_id = 1
        repl_type = "primary"
        replica_generation = "deadbeef000100000000"
        backoff_min_secs = 100
        backoff_max_secs = 10
        "#,
    );
    assert!(matches!(
        ReplicaConfig::load(f.path()),
        Err(ConfigError::BackoffRange { .. })
    ));
}
