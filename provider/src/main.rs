//! llmhub - publish a local model to the LLMHub network.

use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use llmhub_provider::cli::{Cli, Command};
use llmhub_provider::consumer::{AskOptions, ConsumerClient, HubHealth};
use llmhub_provider::{api, Config, Provider};

const CHAT_MAX_TOKENS: u32 = 1024;
const CHAT_TEMPERATURE: f64 = 0.7;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.default_log_filter())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.resolved_command() {
        Command::Publish => publish(&cli).await,
        Command::Status => status(&cli).await,
        Command::Models => models(&cli).await,
        Command::Ask {
            model,
            max_tokens,
            temperature,
            stream,
            prompt,
        } => {
            let options = AskOptions {
                max_tokens: Some(max_tokens),
                temperature: Some(temperature),
            };
            ask(&cli, &model, &prompt.join(" "), &options, stream).await
        }
        Command::Chat { model } => chat(&cli, &model).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = Config::load().map_err(|e| {
        format!(
            "Failed to load configuration: {}. \
             Make sure config.toml exists or set LLMHUB__PROVIDER__MODEL and LLMHUB__PROVIDER__TOKEN.",
            e
        )
    })?;
    if let Some(hub_url) = &cli.hub_url {
        config.gateway.hub_url = hub_url.clone();
    }
    Ok(config)
}

fn consumer(cli: &Cli) -> Result<ConsumerClient, Box<dyn std::error::Error>> {
    let config = load_config(cli)?;
    Ok(ConsumerClient::new(&config.gateway.hub_url)?)
}

async fn publish(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli)?;
    let status_api = config.status_api.clone();

    let provider = Provider::start(config).await?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    if let Some(api_config) = status_api {
        let session = provider.session();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(&api_config, session, cancel).await {
                tracing::error!("{}", e);
            }
        });
    }

    println!("Model published. Press Ctrl+C to stop.");
    provider.run(cancel).await?;
    Ok(())
}

async fn status(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let client = consumer(cli)?;
    println!("Checking hub at {} ...", client.hub_url());

    match client.health().await {
        Ok(HubHealth::Healthy) => println!("Status:  Healthy"),
        Ok(HubHealth::Unhealthy(code)) => println!("Status:  Unhealthy (HTTP {})", code),
        Err(e) => {
            println!("Status:  Unreachable");
            return Err(e.into());
        }
    }
    Ok(())
}

async fn models(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let models = consumer(cli)?.list_models().await?;

    if models.is_empty() {
        println!("No models available.");
        return Ok(());
    }

    println!("{:<24} {:<12} OBJECT", "MODEL", "OWNER");
    for model in models {
        println!("{:<24} {:<12} {}", model.id, model.owned_by, model.object);
    }
    Ok(())
}

async fn ask(
    cli: &Cli,
    model: &str,
    prompt: &str,
    options: &AskOptions,
    stream: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = consumer(cli)?;

    if stream {
        print!("{}: ", model);
        let result = client.stream(model, prompt, options, print_token).await;
        println!();
        return Ok(result?);
    }

    let text = client.ask(model, prompt, options).await?;
    println!("{}: {}", model, text);
    Ok(())
}

async fn chat(cli: &Cli, model: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = consumer(cli)?;
    let options = AskOptions {
        max_tokens: Some(CHAT_MAX_TOKENS),
        temperature: Some(CHAT_TEMPERATURE),
    };

    println!("Starting chat with {} (type 'exit' to quit)\n", model);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("You: ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") {
            println!("Goodbye!");
            break;
        }

        print!("{}: ", model);
        let result = client.stream(model, input, &options, print_token).await;
        println!();
        if let Err(e) = result {
            println!("Error: {}", e);
        }
        println!();
    }
    Ok(())
}

fn print_token(token: &str) -> llmhub_provider::Result<()> {
    print!("{}", token);
    let _ = std::io::stdout().flush();
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn shutdown_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutting down...");
    token.cancel();
}
