//! ollama-bench CLI

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info};

use ollama_bench::benchmark::{
  load_questions, BenchmarkRunner, BenchmarkSettings, CsvSink,
  DEFAULT_DELAY_MS,
};
use ollama_bench::{
  ChatMessage, OllamaClient, OllamaConfig, OptionOverrides, PullOutcome,
};

#[derive(Parser)]
#[command(name = "ollama-bench")]
#[command(about = "Benchmark and query LLMs served by Ollama")]
#[command(version)]
struct Cli
{   #[command(subcommand)]
    command: Commands
  , /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>
  , /// Server base URL, overrides the config file
    #[arg(long, env = "OLLAMA_BENCH_URL")]
    url: Option<String>
  , /// Request timeout in seconds, overrides the config file
    #[arg(long, env = "OLLAMA_BENCH_TIMEOUT")]
    timeout: Option<u64>
  , /// Echo answers as they stream (debug, returns no value)
    #[arg(long)]
    stream: bool
  , /// Let reasoning models think before answering
    #[arg(long)]
    think: bool
  , /// Enable debug logging
    #[arg(short, long)]
    verbose: bool
}

#[derive(Subcommand)]
enum Commands
{   /// List models available on the server
    Models
  , /// Download a model onto the server
    Pull
    {   name: String
      , #[arg(default_value = "latest")]
        tag: String
    }
  , /// Send one prompt and print the normalized result as JSON
    Ask
    {   #[arg(short, long)]
        model: String
      , prompt: String
      , /// Optional system message, switches to the chat endpoint
        #[arg(long)]
        system: Option<String>
      , /// JSON schema file requesting structured output
        #[arg(long)]
        schema: Option<PathBuf>
      , /// Option overrides as a JSON object, e.g. '{"temperature":0}'
        #[arg(long)]
        options: Option<String>
    }
  , /// Run a question set against one or more models
    Run
    {   /// Question set (JSON array)
        #[arg(short, long)]
        questions: PathBuf
      , /// Comma-separated model list
        #[arg(short, long, value_delimiter = ',', required = true)]
        models: Vec<String>
      , /// CSV file rows are appended to
        #[arg(short, long, default_value = "benchmark_results.csv")]
        output: PathBuf
      , /// Pause between requests in milliseconds
        #[arg(long, default_value_t = DEFAULT_DELAY_MS)]
        delay_ms: u64
      , /// Option overrides as a JSON object, replaces the run defaults
        #[arg(long)]
        options: Option<String>
    }
}

fn parse_options(raw: Option<&str>)
  -> Result<Option<OptionOverrides>, Box<dyn std::error::Error>>
{   match raw
    {   Some(s) => Ok(Some(serde_json::from_str(s)?))
      , None => Ok(None)
    }
}

fn build_config(cli: &Cli)
  -> Result<OllamaConfig, Box<dyn std::error::Error>>
{   let mut config = match &cli.config
    {   Some(path) => OllamaConfig::from_toml_file(path)?
      , None => OllamaConfig::default()
    };
    if let Some(url) = &cli.url
    {   config.base_url = url.clone();
    }
    if let Some(timeout) = cli.timeout
    {   config.timeout_secs = timeout;
    }
    if cli.stream
    {   config.stream = true;
    }
    if cli.think
    {   config.think = true;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>>
{   let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(
      env_logger::Env::default().default_filter_or(level)
    ).init();

    let config = build_config(&cli)?;
    let client = OllamaClient::new(config)?;

    match cli.command
    {   Commands::Models => {
          let models = client.models().await?;
          println!("Available models ({}):", models.len());
          let names: Vec<&str> = models.iter()
            .map(|m| m.name.as_str())
            .collect();
          println!("{}", names.join(" | "));
        }
      , Commands::Pull { name, tag } => {
          match client.pull_model(&name, &tag).await?
          {   PullOutcome::Completed => {
                info!("Pulled {}:{}", name, tag);
              }
            , PullOutcome::StreamEnded => {
                error!(
                  "Pull of {}:{} ended without a success status",
                  name, tag
                );
              }
          }
        }
      , Commands::Ask { model, prompt, system, schema, options } => {
          let overrides = parse_options(options.as_deref())?;
          let schema: Option<serde_json::Value> = match schema
          {   Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Some(serde_json::from_str(&raw)?)
              }
            , None => None
          };

          let result = match system
          {   Some(system) => {
                client.chat(
                  vec![ChatMessage::system(system), ChatMessage::user(prompt)],
                  &model,
                  schema,
                  overrides.as_ref()
                ).await
              }
            , None => {
                client.completion(
                  &prompt,
                  &model,
                  schema,
                  overrides.as_ref()
                ).await
              }
          };
          println!("{}", serde_json::to_string_pretty(&result)?);
        }
      , Commands::Run { questions, models, output, delay_ms, options } => {
          let questions = load_questions(&questions)?;
          let mut settings = BenchmarkSettings
          {   models
            , delay: Duration::from_millis(delay_ms)
            , ..BenchmarkSettings::default()
          };
          if let Some(overrides) = parse_options(options.as_deref())?
          {   settings.options = overrides;
          }

          let mut sink = CsvSink::open(&output)?;
          let runner = BenchmarkRunner::new(&client, settings);
          let summary = runner.run(&questions, &mut sink).await?;

          info!(
            "Benchmark finished: {} rows written, {} failed, skipped {:?}",
            summary.rows_written,
            summary.failed,
            summary.skipped_models
          );
          info!("Results saved to {}", output.display());
        }
    }

    Ok(())
}
