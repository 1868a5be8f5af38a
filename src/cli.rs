//! Command-line interface for modelrelay
//!
//! Provides argument parsing and subcommand handling for the modelrelay binary.

use clap::{Parser, Subcommand};

/// Resilient failover proxy for LLM chat-completion APIs
#[derive(Parser)]
#[command(name = "modelrelay")]
#[command(version)]
#[command(about = "Resilient failover proxy for LLM chat-completion APIs")]
#[command(
    long_about = "Modelrelay intercepts chat-completion requests and transparently \
    retries, reroutes, or abandons them across a configured pool of provider/model \
    endpoints, absorbing transient provider failures before they reach the caller."
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate a template configuration file
    Config {
        /// Output file path (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<String>,
    },
}

/// Generate template configuration content
pub fn generate_config_template() -> &'static str {
    r#"# modelrelay configuration
# ========================
#
# Top-level keys must come before the first table header.
#
# The model pool: either an ordered preference list...
models = ["openai/gpt-4", "azure/gpt-4"]
# ...or a weighted pool (weights in (0, 1], need not sum to 1):
# [models]
# "openai/gpt-4" = 0.7
# "azure/gpt-4" = 0.3

[server]
host = "127.0.0.1"
port = 3000

# Template requests, one per provider. The provider is inferred from the URL
# host; set `provider` explicitly when the host gives no hint.
[[clients]]
url = "https://api.openai.com/v1/chat/completions"
[clients.headers]
Authorization = "Bearer sk-..."

[[clients]]
url = "https://YOUR-RESOURCE.azure.openai.com/openai/deployments/gpt-4/chat/completions"
[clients.headers]
api-key = "YOUR-AZURE-KEY"

# Attempt budgets per endpoint (default 1)
[max_retries]
"openai/gpt-4" = 3

# Per-attempt deadline in seconds (default 100)
[timeout]
"openai/gpt-4" = 30.0

# Delay between attempts of the same endpoint, seconds (default 1)
[backoff]
"openai/gpt-4" = 0.5

# Status-aware budgets: flat (all endpoints) or nested per endpoint
[status_code_retry]
"429" = 3
# [status_code_retry."openai/gpt-4"]
# "429" = 5

# Prefix messages prepended when an endpoint is attempted
# [[model_messages."openai/gpt-4"]]
# role = "system"
# content = "You are a helpful assistant."

# Latency health tracking: window is clamped to [1, 10], recovery to 1 hour
[model_latency."openai/gpt-4"]
threshold_seconds = 3.5
window_size = 5
recovery_seconds = 60.0

# Error-rate health tracking per status code
[model_error_tracking."openai/gpt-4"."500"]
error_percent_threshold = 80.0
window_size = 5
recovery_seconds = 120.0

[model_limits]
max_samples_per_endpoint = 1000
max_recovery_seconds = 3600.0

# Sample store: "memory" (single process) or "redis" (shared health state)
[store]
backend = "memory"
# backend = "redis"
# address = "redis://127.0.0.1:6379"
# db = 0

# Sample retention; omit cleanup_interval_seconds to disable the sweeper
[retention]
max_age_seconds = 86400.0
cleanup_interval_seconds = 300.0

[observability]
log_level = "info"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::str::FromStr;

    #[test]
    fn test_template_parses_as_valid_config() {
        let template = generate_config_template();
        let config = Config::from_str(template).expect("template must be a valid config");
        assert_eq!(config.models().len(), 2);
    }

    #[test]
    fn test_cli_parses_default_config_path() {
        let cli = Cli::parse_from(["modelrelay"]);
        assert_eq!(cli.config, "config.toml");
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_parses_config_subcommand() {
        let cli = Cli::parse_from(["modelrelay", "config", "--output", "out.toml"]);
        match cli.command {
            Some(Command::Config { output }) => assert_eq!(output.as_deref(), Some("out.toml")),
            None => panic!("expected config subcommand"),
        }
    }
}
