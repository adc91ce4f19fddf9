use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use crate::api;
use crate::error::SdkError;
use crate::module::Module;
use crate::settings::Settings;

#[derive(Parser)]
#[command(about = "Serve a Starbreeder module over HTTP")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    settings: Settings,
}

pub fn run<M: Module>(module: M) -> ExitCode {
    if let Err(report) = start(module) {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<SdkError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SdkError) -> u8 {
    if error.is_startup() { 2 } else { 1 }
}

fn start<M: Module>(module: M) -> miette::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;
    runtime.block_on(api::serve(Arc::new(module), &cli.settings))?;
    Ok(())
}
