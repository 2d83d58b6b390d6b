//! Server configuration and utility tests

use std::env;

use huddle_server::config::ServerConfig;

// Environment mutation is process-global, so every from_env scenario lives
// in this single test.
#[test]
fn config_from_env() {
    for key in [
        "HUDDLE_HOST",
        "HUDDLE_PORT",
        "HUDDLE_DATABASE_URL",
        "HUDDLE_MAX_MESSAGE_SIZE",
        "HUDDLE_WS_PING_INTERVAL",
        "HUDDLE_SETUP_TIMEOUT",
        "HUDDLE_MAX_CONNECTIONS",
        "HUDDLE_MAX_CONNECTIONS_PER_IP",
        "HUDDLE_CORS_ORIGINS",
        "HUDDLE_ADMIN_TOKEN",
    ] {
        env::remove_var(key);
    }

    let config = ServerConfig::from_env().unwrap();
    assert_eq!(config.host, "0.0.0.0");
    assert_eq!(config.port, 8090);
    assert_eq!(config.setup_timeout_seconds, 10);
    assert_eq!(config.cors_origins, None);
    assert_eq!(config.admin_token, None);

    env::set_var("HUDDLE_PORT", "9000");
    env::set_var("HUDDLE_MAX_CONNECTIONS", "0");
    env::set_var("HUDDLE_ADMIN_TOKEN", "sekrit");
    let config = ServerConfig::from_env().unwrap();
    assert_eq!(config.port, 9000);
    assert_eq!(config.max_connections, 0);
    assert_eq!(config.admin_token.as_deref(), Some("sekrit"));

    env::set_var("HUDDLE_PORT", "not_a_port");
    assert!(ServerConfig::from_env().is_err());

    env::remove_var("HUDDLE_PORT");
    env::remove_var("HUDDLE_MAX_CONNECTIONS");
    env::remove_var("HUDDLE_ADMIN_TOKEN");
}

#[test]
fn port_parsing() {
    let port = "8090".parse::<u16>();
    assert!(port.is_ok());
    assert_eq!(port.unwrap(), 8090u16);

    let invalid = "not_a_port".parse::<u16>();
    assert!(invalid.is_err());
}

#[test]
fn size_limits() {
    // Default inbound frame cap is well above any realistic event payload
    let max_size: usize = 65536;
    let typing_frame = 64usize;
    assert!(typing_frame < max_size);
}
