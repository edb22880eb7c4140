use anyhow::{Context, Result};
use aya::include_bytes_aligned;
use clap::{Parser, Subcommand};
use lockwatch::{LockWatchEngine, metadata, settings::Settings, telemetry};
use log::info;

/// Object built by build.rs; empty when the eBPF toolchain was unavailable.
fn ebpf_object() -> &'static [u8] {
    include_bytes_aligned!(concat!(env!("OUT_DIR"), "/lockwatch"))
}

#[derive(Debug, Parser)]
#[command(name = "lockwatch", version, about = "Trace pthread mutex lock/unlock calls")]
struct Opt {
    /// Verbose output
    #[clap(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Attach the probes and stream events until Ctrl-C (default)
    Run,
    /// Print the event schema as JSON
    Metadata {
        /// Also load the embedded object and check the tracer map
        #[arg(long)]
        validate: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    match opt.command.unwrap_or(Command::Run) {
        Command::Run => run().await,
        Command::Metadata { validate } => print_metadata(validate),
    }
}

async fn run() -> Result<()> {
    let settings = Settings::new().context("Failed to load settings")?;
    telemetry::init_metrics(settings.otel_exporter_otlp_endpoint.as_deref())?;

    let engine = LockWatchEngine::new(settings, ebpf_object())?;
    let result = engine.run().await;

    telemetry::shutdown_metrics();
    result
}

fn print_metadata(validate: bool) -> Result<()> {
    if validate {
        let bpf = lockwatch::load_for_inspection(ebpf_object())?;
        metadata::validate(&bpf)?;
        info!("Tracer map {} validated", metadata::tracer_metadata().map_name);
    }

    let json = serde_json::to_string_pretty(&metadata::tracer_metadata())
        .context("Failed to serialize metadata")?;
    println!("{}", json);
    Ok(())
}
