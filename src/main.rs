use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    weread_export::logging::init().context("init logging")?;

    let cli = weread_export::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        weread_export::cli::Command::Info(args) => {
            weread_export::book::run_info(args).await.context("info")?;
        }
        weread_export::cli::Command::Export(args) => {
            weread_export::acquire::run(args).await.context("export")?;
        }
    }

    Ok(())
}
