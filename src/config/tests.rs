#[cfg(test)]
mod tests {
    use crate::config::{Config, ConfigError, Role};
    use std::io::Write;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = Config::from_json("{}").unwrap();

        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.role(), Role::Standalone);
    }

    #[test]
    fn test_master_role() {
        let config = Config::from_json(
            r#"{
                "address": "0.0.0.0:9000",
                "auth_secret": "s3cret",
                "parts": 4,
                "blocks_per_part": 32,
                "repl_master": { "address": "0.0.0.0:9001" }
            }"#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.parts, 4);
        assert_eq!(config.blocks_per_part, 32);
        match config.role() {
            Role::Master(master) => {
                assert_eq!(master.address.port(), 9001);
                assert!(master.auth_secret.is_empty());
            }
            other => panic!("expected master role, got {:?}", other),
        }
    }

    #[test]
    fn test_conflicting_roles_rejected() {
        let config = Config::from_json(
            r#"{
                "repl_master": { "address": "127.0.0.1:9001" },
                "repl_client": { "address": "127.0.0.1:9002", "auth_secret": "x" }
            }"#,
        )
        .unwrap();

        assert!(matches!(config.validate(), Err(ConfigError::ConflictingRoles)));
    }

    #[test]
    fn test_zero_shard_counts_rejected() {
        let config = Config::from_json(r#"{ "parts": 0 }"#).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Zero("parts"))));

        let config = Config::from_json(r#"{ "blocks_per_part": 0 }"#).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Zero("blocks_per_part"))));
    }

    #[test]
    fn test_unsupported_network_rejected() {
        let config = Config::from_json(r#"{ "network": "unix" }"#).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::UnsupportedNetwork(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "dir": "/var/lib/shardkv", "repl_client": {{ "address": "10.0.0.1:9001" }} }}"#).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.dir.to_str(), Some("/var/lib/shardkv"));
        assert!(matches!(config.role(), Role::Replica(_)));

        assert!(matches!(
            Config::load(std::path::Path::new("/nonexistent/shardkv.json")),
            Err(ConfigError::Read { .. })
        ));
        assert!(matches!(Config::from_json("not json"), Err(ConfigError::Parse(_))));
    }
}
