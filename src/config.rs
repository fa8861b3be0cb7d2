use std::time::Duration;

use crate::gateway::intents::Intents;
use crate::gateway::manager::{GatewayConfig, ShardSpec};
use crate::gateway::throttle::ThrottleConfig;
use crate::rest::RestConfig;

pub struct Config {
    pub rest: RestConfig,
    pub gateway: GatewayConfig,
    /// Intent names in `ACCORD_INTENTS` that were not recognised.
    pub unknown_intents: Vec<String>,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    var(name).and_then(|v| v.parse().ok())
}

fn flag(name: &str) -> bool {
    var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Strip a pasted `Bot ` or `Bearer ` prefix.
pub fn normalize_token(raw: &str) -> Option<String> {
    let token = raw.trim_start();
    let token = token
        .strip_prefix("Bot ")
        .or_else(|| token.strip_prefix("Bearer "))
        .unwrap_or(token)
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// `auto` or a comma separated list of shard ids.
pub fn parse_shards(raw: &str) -> ShardSpec {
    if raw.trim().eq_ignore_ascii_case("auto") {
        return ShardSpec::Auto;
    }
    let ids: Vec<u32> = raw
        .split(',')
        .filter_map(|id| id.trim().parse().ok())
        .collect();
    if ids.is_empty() {
        ShardSpec::Auto
    } else {
        ShardSpec::List(ids)
    }
}

impl Config {
    pub fn from_env() -> Self {
        let rest_defaults = RestConfig::default();
        let token = var("ACCORD_TOKEN")
            .or_else(|| var("DISCORD_TOKEN"))
            .and_then(|t| normalize_token(&t));

        let rest = RestConfig {
            api_url: var("ACCORD_API_URL").unwrap_or(rest_defaults.api_url),
            version: parsed("ACCORD_API_VERSION").unwrap_or(rest_defaults.version),
            token,
            token_type: var("ACCORD_TOKEN_TYPE").unwrap_or(rest_defaults.token_type),
            timeout: parsed("ACCORD_REQUEST_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(rest_defaults.timeout),
            retry_limit: parsed("ACCORD_REQUEST_RETRIES").unwrap_or(rest_defaults.retry_limit),
            user_agent: rest_defaults.user_agent,
        };

        let gateway_defaults = GatewayConfig::default();
        let (intents, unknown_intents) = var("ACCORD_INTENTS")
            .map(|raw| Intents::parse(&raw))
            .unwrap_or((gateway_defaults.intents, Vec::new()));

        let throttle = ThrottleConfig {
            capacity: parsed("ACCORD_GATEWAY_SEND_LIMIT")
                .filter(|c: &u32| *c > 0)
                .unwrap_or(gateway_defaults.throttle.capacity),
            window: parsed("ACCORD_GATEWAY_SEND_WINDOW_MS")
                .filter(|ms: &u64| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(gateway_defaults.throttle.window),
        };

        let gateway = GatewayConfig {
            shards: var("ACCORD_SHARDS")
                .map(|raw| parse_shards(&raw))
                .unwrap_or(ShardSpec::Auto),
            shard_count: parsed("ACCORD_SHARD_COUNT").filter(|c: &u32| *c > 0),
            intents,
            version: parsed("ACCORD_GATEWAY_VERSION").unwrap_or(gateway_defaults.version),
            large_threshold: parsed("ACCORD_LARGE_THRESHOLD")
                .unwrap_or(gateway_defaults.large_threshold),
            emit_raw: flag("ACCORD_EMIT_RAW"),
            throttle,
            ..gateway_defaults
        };

        Self {
            rest,
            gateway,
            unknown_intents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for name in [
            "ACCORD_TOKEN",
            "DISCORD_TOKEN",
            "ACCORD_TOKEN_TYPE",
            "ACCORD_SHARDS",
            "ACCORD_SHARD_COUNT",
            "ACCORD_INTENTS",
            "ACCORD_API_URL",
            "ACCORD_API_VERSION",
            "ACCORD_GATEWAY_VERSION",
            "ACCORD_REQUEST_TIMEOUT_MS",
            "ACCORD_REQUEST_RETRIES",
            "ACCORD_LARGE_THRESHOLD",
            "ACCORD_EMIT_RAW",
            "ACCORD_GATEWAY_SEND_LIMIT",
            "ACCORD_GATEWAY_SEND_WINDOW_MS",
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_default_config() {
        clear_env();
        let config = Config::from_env();
        assert!(config.rest.token.is_none());
        assert_eq!(config.rest.token_type, "Bot");
        assert_eq!(config.rest.api_url, "https://discord.com/api");
        assert_eq!(config.rest.version, 9);
        assert_eq!(config.rest.retry_limit, 5);
        assert_eq!(config.rest.timeout, Duration::from_secs(15));
        assert_eq!(config.gateway.shards, ShardSpec::Auto);
        assert_eq!(config.gateway.version, 9);
        assert_eq!(config.gateway.large_threshold, 250);
        assert_eq!(config.gateway.intents, Intents(0));
        assert_eq!(config.gateway.throttle.capacity, 120);
        assert!(!config.gateway.emit_raw);
    }

    #[test]
    #[serial]
    fn test_token_from_env() {
        clear_env();
        std::env::set_var("ACCORD_TOKEN", "Bot abc.def");
        let config = Config::from_env();
        assert_eq!(config.rest.token.as_deref(), Some("abc.def"));
    }

    #[test]
    #[serial]
    fn test_discord_token_fallback() {
        clear_env();
        std::env::set_var("DISCORD_TOKEN", "xyz");
        let config = Config::from_env();
        assert_eq!(config.rest.token.as_deref(), Some("xyz"));
    }

    #[test]
    #[serial]
    fn test_shard_list_from_env() {
        clear_env();
        std::env::set_var("ACCORD_SHARDS", "0, 2,x");
        std::env::set_var("ACCORD_SHARD_COUNT", "4");
        let config = Config::from_env();
        assert_eq!(config.gateway.shards, ShardSpec::List(vec![0, 2]));
        assert_eq!(config.gateway.shard_count, Some(4));
    }

    #[test]
    #[serial]
    fn test_intents_by_name() {
        clear_env();
        std::env::set_var("ACCORD_INTENTS", "guilds,guild_messages,bogus");
        let config = Config::from_env();
        assert_eq!(config.gateway.intents, Intents(1 | 512));
        assert_eq!(config.unknown_intents, vec!["bogus".to_string()]);
    }

    #[test]
    #[serial]
    fn test_intents_as_bits() {
        clear_env();
        std::env::set_var("ACCORD_INTENTS", "513");
        let config = Config::from_env();
        assert_eq!(config.gateway.intents, Intents(513));
    }

    #[test]
    #[serial]
    fn test_invalid_numbers_fall_back_to_defaults() {
        clear_env();
        std::env::set_var("ACCORD_REQUEST_RETRIES", "many");
        std::env::set_var("ACCORD_REQUEST_TIMEOUT_MS", "-5");
        std::env::set_var("ACCORD_GATEWAY_SEND_LIMIT", "0");
        let config = Config::from_env();
        assert_eq!(config.rest.retry_limit, 5);
        assert_eq!(config.rest.timeout, Duration::from_secs(15));
        assert_eq!(config.gateway.throttle.capacity, 120);
    }

    #[test]
    #[serial]
    fn test_emit_raw_flag() {
        clear_env();
        std::env::set_var("ACCORD_EMIT_RAW", "true");
        std::env::set_var("ACCORD_GATEWAY_SEND_WINDOW_MS", "1000");
        let config = Config::from_env();
        assert!(config.gateway.emit_raw);
        assert_eq!(config.gateway.throttle.window, Duration::from_secs(1));
    }

    #[test]
    fn test_normalize_token() {
        assert_eq!(normalize_token("  Bearer tok "), Some("tok".to_string()));
        assert_eq!(normalize_token("Bot "), None);
        assert_eq!(normalize_token("plain"), Some("plain".to_string()));
    }
}
