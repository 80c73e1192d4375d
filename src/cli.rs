//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// Resilient front end for text-generation providers
#[derive(Parser, Debug)]
#[command(name = "genai-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "GENAI_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "warn",
        env = "GENAI_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "GENAI_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate text through the full resilience chain
    Generate(GenerateArgs),

    /// Check text against the content rules
    Validate {
        /// Text to check (`-` reads standard input)
        #[arg(required = true)]
        text: String,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that the provider is reachable
    Ping,

    /// Print the resolved configuration as YAML
    Config,
}

/// Arguments for `generate`
#[derive(clap::Args, Debug)]
pub struct GenerateArgs {
    /// Prompt text
    #[arg(short, long)]
    pub prompt: String,

    /// Model (defaults to the provider's default model)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Maximum output tokens
    #[arg(long, default_value_t = gateway_core::DEFAULT_MAX_TOKENS)]
    pub max_tokens: u32,

    /// Sampling temperature
    #[arg(short, long, default_value_t = gateway_core::DEFAULT_TEMPERATURE)]
    pub temperature: f32,

    /// System instructions
    #[arg(short, long)]
    pub system: Option<String>,

    /// Provider deadline (e.g. "30s", "500ms")
    #[arg(long, value_parser = parse_duration, default_value = "30s")]
    pub timeout: Duration,

    /// Workload label used for cache keys
    #[arg(long, default_value = gateway_core::GENERIC_KIND)]
    pub kind: String,

    /// Content category (enables similarity matching with --audience)
    #[arg(long)]
    pub category: Option<String>,

    /// Intended audience
    #[arg(long)]
    pub audience: Option<String>,

    /// Admission policy
    #[arg(long, default_value = crate::gateway::DEFAULT_POLICY)]
    pub policy: String,

    /// Caller identity for admission quotas
    #[arg(long, default_value = "cli")]
    pub identifier: String,

    /// Skip admission checks
    #[arg(long, conflicts_with = "wait")]
    pub no_limit: bool,

    /// Wait for admission instead of failing
    #[arg(long)]
    pub wait: bool,

    /// Print the full result as JSON
    #[arg(long)]
    pub json: bool,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    crate::config::humantime_serde::parse(s).map_err(|e| format!("invalid duration '{s}': {e}"))
}
