use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ronin_core::SourceKind;
use ronin_pipeline::PipelineConfig;

#[derive(Debug, Parser)]
#[command(name = "ronin-cli")]
#[command(about = "JobRonin pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Replay the transform pipeline for one raw seed record and print the
    /// trace as JSON.
    Trace {
        /// KEY=value pairs (keys are case-insensitive): SOURCE=<jobspy|
        /// profesia_sk|stepstone> is required, OFFSET=<n> defaults to 0.
        #[arg(required = true)]
        pairs: Vec<String>,
    },
    /// Run the nightly transform list once; keeps running on the configured
    /// cron when the scheduler is enabled.
    Nightly,
    /// Serve the health endpoint.
    Serve,
}

#[derive(Debug, PartialEq, Eq)]
struct TraceArgs {
    source: SourceKind,
    offset: u32,
}

fn parse_trace_args(pairs: &[String]) -> Result<TraceArgs> {
    let mut source = None;
    let mut offset = 0u32;
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected KEY=value, got {pair:?}");
        };
        match key.to_ascii_uppercase().as_str() {
            "SOURCE" => source = Some(value.parse::<SourceKind>()?),
            "OFFSET" => {
                offset = value.parse().with_context(|| {
                    format!("OFFSET must be a non-negative integer, got {value:?}")
                })?
            }
            other => bail!("unrecognized argument key {other:?}"),
        }
    }
    let Some(source) = source else {
        bail!("SOURCE is required (one of jobspy, profesia_sk, stepstone)");
    };
    Ok(TraceArgs { source, offset })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Diagnostics go to stderr; stdout belongs to the trace output.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Trace { pairs } => {
            let args = parse_trace_args(&pairs)?;
            let config = PipelineConfig::from_env()?;
            let log = ronin_pipeline::run_trace_once(&config, args.source, args.offset).await?;
            println!("{}", log.render_json()?);
        }
        Commands::Nightly => {
            let config = PipelineConfig::from_env()?;
            let summary = ronin_pipeline::run_nightly_once(&config).await?;
            println!(
                "nightly complete: run_id={} statements={} started={} finished={}",
                summary.run_id, summary.statements, summary.started_at, summary.finished_at
            );
            if let Some(sched) = ronin_pipeline::maybe_build_scheduler(&config).await? {
                sched.start().await.context("starting scheduler")?;
                tokio::signal::ctrl_c()
                    .await
                    .context("waiting for shutdown signal")?;
            }
        }
        Commands::Serve => ronin_web::serve_from_env().await?,
    }

    Ok(())
}
