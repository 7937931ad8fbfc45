//! BigQuery writer binary.
//!
//! Reads the job configuration from the platform data directory, runs the requested action and
//! maps the outcome to the exit codes the platform expects.

use std::path::PathBuf;
use std::process::ExitCode;

use bq_config::{load_configuration, load_settings};
use bq_connector::app::App;
use bq_connector::error::{APPLICATION_ERROR_EXIT_CODE, ConnectorResult, UNHANDLED_ERROR_EXIT_CODE};
use bq_telemetry::init_tracing;
use clap::Parser;

/// Loads CSV tables from the platform data directory into Google BigQuery.
#[derive(Debug, Parser)]
#[command(name = "bigquery-writer", version, about)]
struct Args {
    /// Directory holding `config.json` and the `in/tables` input files.
    #[arg(long, env = "KBC_DATADIR", default_value = "/data")]
    data_dir: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = init_tracing(env!("CARGO_BIN_NAME")) {
        eprintln!("failed to initialize tracing: {err}");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("application error: cannot start the async runtime: {err}");
            return ExitCode::from(APPLICATION_ERROR_EXIT_CODE);
        }
    };

    // The run is spawned so that a panic surfaces as a join error instead of unwinding main.
    let outcome = runtime.block_on(async move { tokio::spawn(run(args.data_dir)).await });

    match outcome {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            eprint!("{}", err.render_report());
            ExitCode::from(err.exit_code())
        }
        Err(err) if err.is_panic() => {
            eprintln!("unhandled error: {err}");
            ExitCode::from(UNHANDLED_ERROR_EXIT_CODE)
        }
        Err(err) => {
            eprintln!("application error: {err}");
            ExitCode::from(APPLICATION_ERROR_EXIT_CODE)
        }
    }
}

async fn run(data_dir: PathBuf) -> ConnectorResult<()> {
    let configuration = load_configuration(&data_dir)?;
    let settings = load_settings()?;
    let app = App::new(data_dir, configuration, settings)?;

    let mut stdout = std::io::stdout();
    app.run(&mut stdout).await
}
