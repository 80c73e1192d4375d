//! genai-gateway - resilient front end for text-generation providers

use std::io::Read;
use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error};

use gateway_core::{GenerationOptions, GenerationRequest, RequestContext};
use genai_gateway::{
    cli::{Cli, Command, GenerateArgs},
    config::Config,
    gateway::{GenerateOptions, Gateway},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Generate(args) => run_generate(config, args).await,
        Command::Validate { text, json } => run_validate(&text, json),
        Command::Ping => run_ping(config).await,
        Command::Config => run_config(&config),
    }
}

fn build_gateway(config: Config) -> Option<Gateway> {
    match Gateway::new(config) {
        Ok(gateway) => Some(gateway),
        Err(e) => {
            eprintln!("❌ Failed to start gateway: {e}");
            None
        }
    }
}

/// Run a single generation
async fn run_generate(config: Config, args: GenerateArgs) -> ExitCode {
    let Some(gateway) = build_gateway(config) else {
        return ExitCode::FAILURE;
    };

    let mut options = GenerationOptions::default()
        .with_max_tokens(args.max_tokens)
        .with_temperature(args.temperature)
        .with_timeout(args.timeout);
    if let Some(model) = args.model {
        options = options.with_model(model);
    }
    if let Some(system) = args.system {
        options = options.with_system_prompt(system);
    }

    let mut context = RequestContext::new(args.kind);
    if let Some(category) = args.category {
        context = context.with_category(category);
    }
    if let Some(audience) = args.audience {
        context = context.with_audience(audience);
    }

    let request = GenerationRequest::new(args.prompt)
        .with_options(options)
        .with_context(context);

    let mut admission = GenerateOptions::default()
        .with_policy(args.policy)
        .with_identifier(args.identifier);
    if args.no_limit {
        admission = admission.unlimited();
    }
    if args.wait {
        admission = admission.waiting();
    }

    match gateway.generate(&request, &admission).await {
        Ok(result) => {
            debug!(usage = ?gateway.usage_stats(), "Generation complete");
            if args.json {
                match serde_json::to_string_pretty(&result) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        eprintln!("❌ Failed to serialize result: {e}");
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                println!("{}", result.content);
                for warning in &result.validation.warnings {
                    eprintln!("⚠️  {warning}");
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

/// Check text against the content rules
fn run_validate(text: &str, json: bool) -> ExitCode {
    let text = if text == "-" {
        let mut buf = String::new();
        if let Err(e) = std::io::stdin().read_to_string(&mut buf) {
            eprintln!("❌ Failed to read standard input: {e}");
            return ExitCode::FAILURE;
        }
        buf
    } else {
        text.to_string()
    };

    let result = genai_gateway::validation::validate_content(&text);

    if json {
        match serde_json::to_string_pretty(&result) {
            Ok(out) => println!("{out}"),
            Err(e) => {
                eprintln!("❌ Failed to serialize result: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        for e in &result.errors {
            println!("❌ {e}");
        }
        for w in &result.warnings {
            println!("⚠️  {w}");
        }
        if result.is_valid && result.warnings.is_empty() {
            println!("✅ Content looks good");
        }
    }

    if result.is_valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Probe the provider
async fn run_ping(config: Config) -> ExitCode {
    let Some(gateway) = build_gateway(config) else {
        return ExitCode::FAILURE;
    };
    let base_url = gateway.config().provider.base_url.clone();

    if gateway.is_available().await {
        println!("✅ Provider reachable at {base_url}");
        ExitCode::SUCCESS
    } else {
        println!("❌ Provider unreachable at {base_url}");
        ExitCode::FAILURE
    }
}

/// Print the resolved configuration
fn run_config(config: &Config) -> ExitCode {
    match serde_yaml::to_string(config) {
        Ok(yaml) => {
            print!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Failed to serialize configuration: {e}");
            ExitCode::FAILURE
        }
    }
}
