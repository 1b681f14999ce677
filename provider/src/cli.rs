//! Command-line interface of the `llmhub` binary.

use clap::{Parser, Subcommand};

/// Publish a local model to the LLMHub network, or use the models on it.
///
/// Configuration is read from config.toml and LLMHUB__SECTION__KEY variables.
#[derive(Debug, Parser)]
#[command(name = "llmhub")]
#[command(version)]
pub struct Cli {
    /// Hub URL, overriding gateway.hub_url from the configuration
    #[arg(long, global = true)]
    pub hub_url: Option<String>,

    /// Enable debug logging (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// The subcommand to run; `publish` when none is given.
    pub fn resolved_command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Publish)
    }

    /// Log filter used when `RUST_LOG` is not set.
    pub fn default_log_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum Command {
    /// Publish the configured model to the hub (default)
    Publish,

    /// Check that the hub is reachable and healthy
    Status,

    /// List models available on the network
    Models,

    /// Send one prompt to a model and print the answer
    Ask {
        /// Model to use
        #[arg(short, long)]
        model: String,

        /// Maximum tokens in the response
        #[arg(long, default_value_t = 512)]
        max_tokens: u32,

        /// Sampling temperature
        #[arg(short, long, default_value_t = 0.7)]
        temperature: f64,

        /// Print tokens as they arrive
        #[arg(short, long)]
        stream: bool,

        /// Prompt text; several words are joined with spaces
        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,
    },

    /// Interactive chat session with a model
    Chat {
        /// Model to chat with
        #[arg(short, long)]
        model: String,
    },
}
