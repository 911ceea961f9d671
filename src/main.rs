#![allow(clippy::result_large_err)]

use anyhow::{anyhow, Context};
use databridge::config::bridge::known_feature_flags;
use databridge::config::{BridgeConfig, ServiceConfig};
use databridge::telemetry;
use std::path::PathBuf;

enum CliCommand {
    Run { bridge_path: Option<String> },
    Validate { configs: Vec<String> },
    ListFeatureFlags,
    Help,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing().context("failed to initialise telemetry")?;

    match parse_cli_args()? {
        CliCommand::Run { bridge_path } => {
            let config = ServiceConfig::load().context("failed to load configuration")?;

            let app = databridge::app::DataBridgeApp::initialise(config, bridge_path)
                .await
                .context("failed to construct application")?;

            app.run().await.context("application runtime error")
        }
        CliCommand::Validate { configs } => run_validate_command(configs),
        CliCommand::ListFeatureFlags => {
            print_feature_flags();
            Ok(())
        }
        CliCommand::Help => {
            print_help();
            Ok(())
        }
    }
}

fn parse_cli_args() -> anyhow::Result<CliCommand> {
    let mut args = std::env::args().skip(1);
    let Some(first) = args.next() else {
        return Ok(CliCommand::Run { bridge_path: None });
    };

    if first == "validate" {
        let configs: Vec<String> = args.collect();
        if configs.is_empty() {
            anyhow::bail!("databridge validate requires at least one config path");
        }
        return Ok(CliCommand::Validate { configs });
    }

    let mut bridge_path = None;
    let mut pending = Some(first);

    loop {
        let arg = match pending.take() {
            Some(value) => value,
            None => match args.next() {
                Some(value) => value,
                None => break,
            },
        };

        match arg.as_str() {
            "-c" | "--config" => {
                if bridge_path.is_some() {
                    anyhow::bail!("bridge config path specified multiple times");
                }
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("expected path after {arg}"))?;
                bridge_path = Some(value);
            }
            "-h" | "--help" => return Ok(CliCommand::Help),
            "--list-feature-flags" => return Ok(CliCommand::ListFeatureFlags),
            other => anyhow::bail!("unrecognised argument `{other}`"),
        }
    }

    Ok(CliCommand::Run { bridge_path })
}

fn run_validate_command(configs: Vec<String>) -> anyhow::Result<()> {
    let mut had_error = false;

    for config in configs {
        let path = PathBuf::from(&config);
        match BridgeConfig::from_path(&path) {
            Ok(_) => println!("validated {}", path.display()),
            Err(err) => {
                eprintln!("{err}");
                had_error = true;
            }
        }
    }

    if had_error {
        Err(anyhow!("one or more configs failed validation"))
    } else {
        Ok(())
    }
}

fn print_feature_flags() {
    println!("Supported feature flags:");
    for flag in known_feature_flags() {
        println!("  - {flag}");
    }
}

fn print_help() {
    println!(
        "\
Usage: databridge [OPTIONS]
       databridge validate <CONFIG>...

Options:
  -c, --config <PATH>    Path to the bridge configuration document
      --list-feature-flags
                          Print the supported app.feature_flags entries
  -h, --help             Print this help message
"
    );
}
