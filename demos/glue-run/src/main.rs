use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use glue::core::secret::ChainResolver;
use glue::core::{BuildOptions, Engine, EngineConfig, Program, Providers};
use log::info;
use tokio_stream::StreamExt;

/// Run a `.glue` application
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the `.glue` file
    file: PathBuf,

    #[arg(short, long, help = "Task handed to the entry model")]
    input: String,

    #[arg(long, help = "Override the iteration budget")]
    max_iterations: Option<u32>,

    #[arg(long, help = "Accept providers that are only registered at run time")]
    defer_providers: bool,

    #[arg(long, help = "Print run events as they happen")]
    events: bool,

    #[arg(long, help = "Print the trace as JSON")]
    trace: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    glue::init_logging();
    let args = Args::parse();

    let providers = Providers::builtin();
    let options = if args.defer_providers {
        BuildOptions::default().defer_unknown_providers()
    } else {
        BuildOptions::default()
    };
    let program = Program::from_path(&args.file, &providers.catalog(), &options).await?;
    info!(
        "Running `{}` from {}",
        program.registry().app().name,
        args.file.display()
    );

    // command line wins over the app block
    let mut config = EngineConfig::default().with_app_overrides(&program.registry().app().settings);
    if let Some(max) = args.max_iterations {
        config = config.max_iterations(max);
    }
    let (registry, graph) = program.into_parts();
    let engine = Engine::new(
        registry,
        graph,
        providers,
        Arc::new(ChainResolver::standard()),
        config,
    );

    let printer = if args.events {
        engine.take_event_receiver().await.map(|mut events| {
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    match serde_json::to_string(&event) {
                        Ok(line) => eprintln!("{line}"),
                        Err(e) => eprintln!("unprintable event: {e}"),
                    }
                }
            })
        })
    } else {
        None
    };

    let result = engine.run(&args.input).await;
    if let Some(printer) = printer {
        printer.abort();
    }

    match result {
        Ok(output) => {
            println!("{}", output.artifact);
            if args.trace {
                println!("{}", serde_json::to_string_pretty(&output.trace)?);
            }
            Ok(())
        }
        Err(failure) => {
            if args.trace {
                eprintln!("{}", serde_json::to_string_pretty(&failure.trace)?);
            }
            if let Some(state) = &failure.last_state {
                eprintln!("Last output from {}:\n{}", state.model, state.output);
            }
            Err(failure.into())
        }
    }
}
