//! Configuration tests.
//!
//! Tests cover:
//! - Default values and their validity
//! - Per-section validation
//! - File, environment and CLI precedence

mod global_config_tests {
    use crate::config::global::{
        DecoderSettings, InterestSetting, LimitsConfig, LogLevel, NetworkConfig, RuntimeConfig,
        UpgradeConfig,
    };
    use wsring_proto::{Interest, Role};

    #[test]
    fn test_network_config_default() {
        let config = NetworkConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_network_config_valid_ipv6() {
        let config = NetworkConfig {
            host: "::".to_string(),
            port: 9000,
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr().unwrap().port(), 9000);
    }

    #[test]
    fn test_network_config_invalid_host() {
        let config = NetworkConfig {
            host: "not-an-ip-address".to_string(),
            port: 8000,
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("Invalid host address")));
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_runtime_config_default() {
        let config = RuntimeConfig::default();
        assert!(config.worker_threads >= 1 && config.worker_threads <= 4);
        assert_eq!(config.thread_name, "wsring-acceptor");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_runtime_config_zero_workers() {
        let config = RuntimeConfig {
            worker_threads: 0,
            ..RuntimeConfig::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("worker_threads must be > 0")));
    }

    #[test]
    fn test_runtime_config_stack_bounds() {
        let small = RuntimeConfig {
            thread_stack_size: 1024,
            ..RuntimeConfig::default()
        };
        assert!(small.validate().is_err());

        let large = RuntimeConfig {
            thread_stack_size: 128 * 1024 * 1024,
            ..RuntimeConfig::default()
        };
        assert!(large.validate().is_err());
    }

    #[test]
    fn test_log_level_parse_and_display() {
        for (text, level) in [
            ("trace", LogLevel::Trace),
            ("DEBUG", LogLevel::Debug),
            ("info", LogLevel::Info),
            ("warning", LogLevel::Warn),
            ("error", LogLevel::Error),
        ] {
            assert_eq!(text.parse::<LogLevel>().unwrap(), level);
        }
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Warn.to_string(), "warn");
    }

    #[test]
    fn test_limits_target_floor() {
        let config = LimitsConfig {
            raise_nofile: true,
            nofile_target: Some(10),
        };
        assert!(config.validate().is_err());
        assert!(LimitsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_upgrade_config_bounds() {
        assert!(UpgradeConfig::default().validate().is_ok());
        let config = UpgradeConfig {
            handshake_timeout_ms: 0,
            max_request_bytes: 10,
        };
        assert_eq!(config.validate().unwrap_err().len(), 2);
    }

    #[test]
    fn test_decoder_settings_map_to_server_decoder() {
        let settings = DecoderSettings {
            interest: InterestSetting::Any,
            check_utf8: false,
            ..DecoderSettings::default()
        };
        let decoder = settings.decoder_config();
        assert_eq!(decoder.role, Role::Server);
        assert_eq!(decoder.interest, Interest::Data);
        assert!(!decoder.check_utf8);
        assert_eq!(decoder.max_message_size, settings.max_message_size);
    }

    #[test]
    fn test_decoder_settings_validation() {
        assert!(DecoderSettings::default().validate().is_ok());
        let settings = DecoderSettings {
            max_message_size: 0,
            max_pending_bytes: 2,
            ..DecoderSettings::default()
        };
        assert_eq!(settings.validate().unwrap_err().len(), 2);

        // The carry bound is irrelevant when carrying is off.
        let no_carry = DecoderSettings {
            carry_partial: false,
            max_pending_bytes: 0,
            ..DecoderSettings::default()
        };
        assert!(no_carry.validate().is_ok());
    }
}

mod server_config_tests {
    use crate::config::ServerConfig;

    #[test]
    fn test_default_server_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_errors_are_collected_across_sections() {
        let mut config = ServerConfig::default();
        config.network.host = "bad".to_string();
        config.netio.uring_entries = 3;
        config.decoder.max_message_size = 0;
        let errors = config.validate().unwrap_err();
        assert!(errors.len() >= 3);
    }

    #[test]
    fn test_oversized_request_limit_rejected() {
        let mut config = ServerConfig::default();
        config.upgrade.max_request_bytes = 2 * 1024 * 1024;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("max_request_bytes")));
    }

    #[test]
    fn test_default_config_toml_round_trip() {
        let text = toml::to_string_pretty(&ServerConfig::default()).unwrap();
        let parsed: ServerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.port, 8000);
        assert_eq!(parsed.netio.buffer_pool.capacity, 1000);
        assert!(parsed.netio.read_deadline_ms.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let parsed: ServerConfig = toml::from_str(
            r#"
            [netio]
            readiness_mode = "edge"
            read_deadline_ms = 250

            [decoder]
            interest = "binary"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.netio.readiness_mode, crate::netio::ReadinessMode::Edge);
        assert_eq!(parsed.netio.read_deadline_ms, Some(250));
        assert_eq!(parsed.netio.buffer_pool.buffer_size, 4096);
        assert_eq!(parsed.decoder.interest, crate::config::InterestSetting::Binary);
        assert!(parsed.decoder.carry_partial);
    }
}

mod loader_tests {
    use crate::config::loader::{load_config_file, resolve_config, CliArgs};
    use crate::config::{LogLevel, ServerConfig};
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn cli_with_missing_file() -> CliArgs {
        CliArgs {
            config: "/nonexistent/wsring-test.toml".to_string(),
            ..CliArgs::default()
        }
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_config_file("/nonexistent/wsring-test.toml").unwrap();
        assert_eq!(config.network.port, 8000);
    }

    #[test]
    fn test_file_values_are_loaded() {
        let path = std::env::temp_dir().join(format!("wsring-config-{}.toml", std::process::id()));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "[network]\nport = 9100\n\n[logging]\nlevel = \"debug\"").unwrap();
        }
        let config = load_config_file(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.network.port, 9100);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_env_overrides_defaults() {
        let config = resolve_config(
            &cli_with_missing_file(),
            env(&[
                ("WSRING_NETWORK__PORT", "9200"),
                ("WSRING_LOGGING__LEVEL", "warn"),
                ("WSRING_NETIO__READ_DEADLINE_MS", "1500"),
                ("WSRING_NETIO__READINESS_MODE", "edge"),
                ("WSRING_DECODER__CARRY_PARTIAL", "false"),
            ]),
        )
        .unwrap();
        assert_eq!(config.network.port, 9200);
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert_eq!(config.netio.read_deadline_ms, Some(1500));
        assert_eq!(config.netio.readiness_mode, crate::netio::ReadinessMode::Edge);
        assert!(!config.decoder.carry_partial);
    }

    #[test]
    fn test_cli_overrides_env() {
        let cli = CliArgs {
            port: Some(9300),
            log_level: Some("error".to_string()),
            ..cli_with_missing_file()
        };
        let config = resolve_config(
            &cli,
            env(&[("WSRING_NETWORK__PORT", "9200"), ("WSRING_LOGGING__LEVEL", "warn")]),
        )
        .unwrap();
        assert_eq!(config.network.port, 9300);
        assert_eq!(config.logging.level, LogLevel::Error);
    }

    #[test]
    fn test_invalid_result_is_rejected() {
        let cli = CliArgs {
            host: Some("nope".to_string()),
            ..cli_with_missing_file()
        };
        let err = resolve_config(&cli, env(&[])).unwrap_err();
        assert!(err.to_string().contains("validation failed"));
    }

    #[test]
    fn test_ring_mode_from_env() {
        let config = resolve_config(
            &cli_with_missing_file(),
            env(&[("WSRING_NETIO__READINESS_MODE", "Ring")]),
        )
        .unwrap();
        assert_eq!(config.netio.readiness_mode, crate::netio::ReadinessMode::Ring);
        assert!(crate::worker::LoopSettings::from_config(&config).ring_only);
        assert!(!crate::worker::LoopSettings::from_config(&ServerConfig::default()).ring_only);
    }

    #[test]
    fn test_bad_readiness_mode_in_env() {
        let result = resolve_config(
            &cli_with_missing_file(),
            env(&[("WSRING_NETIO__READINESS_MODE", "level")]),
        );
        assert!(result.is_err());
    }
}
