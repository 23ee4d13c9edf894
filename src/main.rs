use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;

mod config;
mod evaluation;
mod models;
mod output;
mod platform;
mod prompt;
mod proxy;
mod runner;
mod scorers;
mod setup;
mod task;
mod telemetry;
mod template;

use crate::config::{RunFile, Settings};
use crate::models::{ChatMessage, ChatRequest};
use crate::output::OutputFormat;
use crate::platform::PlatformClient;
use crate::proxy::ProxyClient;
use crate::runner::Runner;
use crate::setup::SetupOptions;

/// Walkthroughs of an LLM observability platform: proxy, prompts, evals
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log progress for each remote call
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Env file loaded before reading settings
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one chat completion through the AI proxy
    Proxy {
        #[arg(short, long, default_value = "claude-4-sonnet-20250514")]
        model: String,

        #[arg(long, default_value = "Hello, how are you?")]
        message: String,

        /// Optional system prompt sent before the message
        #[arg(long)]
        system: Option<String>,

        #[arg(long, default_value_t = 42)]
        seed: i64,

        /// Send the request without a seed
        #[arg(long)]
        no_seed: bool,
    },

    /// Load a stored prompt, build it and run it through the proxy
    Prompt {
        #[arg(long, default_value = setup::COUNTRY_PROMPT_SLUG)]
        slug: String,

        /// Value bound to `{{input}}`
        #[arg(short, long, default_value = "France")]
        input: String,

        /// Project owning the prompt, defaults to BRAINTRUST_PROJECT
        #[arg(long)]
        project: Option<String>,
    },

    /// Run the evals of a TOML run file
    Eval {
        /// Path to the TOML run file
        run_file: PathBuf,

        /// Output format: plain or json
        #[arg(short, long, default_value = "plain")]
        output: OutputFormat,

        /// Keep results local instead of creating experiments
        #[arg(long)]
        no_send_logs: bool,
    },

    /// Create the demo project, prompt and datasets
    Setup {
        /// Do not create the Countries dataset
        #[arg(long)]
        skip_countries: bool,

        /// JSON file of conversations for the Multiturn dataset
        #[arg(long)]
        multiturn: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    telemetry::init_tracing(cli.json_logs, telemetry::level_for(cli.verbose));
    Settings::load_dotenv(&cli.env_file)?;
    let settings = Settings::from_env()?;

    match cli.command {
        Command::Proxy {
            model,
            message,
            system,
            seed,
            no_seed,
        } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(message));
            let request = ChatRequest {
                model,
                messages,
                seed: (!no_seed).then_some(seed),
            };

            let proxy = ProxyClient::new(&settings);
            let response = proxy.chat(&request).await?;
            println!("{}", response.first_content());
        }
        Command::Prompt {
            slug,
            input,
            project,
        } => {
            let project = project.unwrap_or_else(|| settings.project.clone());
            let platform = PlatformClient::new(&settings);
            let proxy = ProxyClient::new(&settings);

            let stored = platform.load_prompt(&project, &slug).await?;
            let reply = prompt::complete_prompt(&stored, &json!({ "input": input }), &proxy).await?;
            println!("{}", reply);
        }
        Command::Eval {
            run_file,
            output,
            no_send_logs,
        } => {
            let run = RunFile::from_file(&run_file)?;
            let runner = Runner::new(settings, !no_send_logs);
            let results = runner.run_evaluations(&run).await?;
            output::print_results(&results, output);
        }
        Command::Setup {
            skip_countries,
            multiturn,
        } => {
            let platform = PlatformClient::new(&settings);
            let options = SetupOptions {
                skip_countries,
                multiturn_file: multiturn,
            };
            setup::run_setup(&settings, &platform, &options).await?;
        }
    }

    Ok(())
}
