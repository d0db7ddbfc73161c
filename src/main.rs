//! CLI entry point.
//!
//! One invocation runs one ad-hoc load and prints the aggregate; the
//! `server` subcommand exposes the full operation set over HTTP.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use barrage::app::App;
use barrage::metrics;
use barrage::model::{HttpMethod, RunRequest};
use barrage::output::{AnsiWriter, ResultWriter};
use barrage::server;
use barrage::store::RunStore;
use barrage::stream::StreamEvent;

#[derive(Debug, Parser)]
#[command(version, about = "HTTP load generator with a persistent run catalog")]
struct Cli {
    /// Path to the catalog database
    #[arg(long, default_value = "barrage.db", global = true)]
    database: String,

    /// Enable verbose logging (overridden by RUST_LOG)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Expose the full operation set over HTTP
    Server {
        /// Port to bind
        #[arg(long, default_value_t = 5000)]
        port: u16,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Target URL for the ad-hoc run
    #[arg(long)]
    url: Option<String>,

    /// HTTP method
    #[arg(long, default_value = "GET", value_parser = parse_method)]
    method: HttpMethod,

    /// Number of concurrent virtual users
    #[arg(long, default_value_t = 10)]
    users: u32,

    /// Total request budget [default: 100 unless --duration is set]
    #[arg(long)]
    requests: Option<u64>,

    /// Wall-clock duration in seconds instead of a request budget
    #[arg(long)]
    duration: Option<u64>,

    /// Request body
    #[arg(long)]
    body: Option<String>,

    /// Content-Type header sent with the body
    #[arg(long, default_value = "application/json")]
    content_type: String,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,
}

fn parse_method(raw: &str) -> Result<HttpMethod, String> {
    raw.parse()
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = metrics::register_metrics() {
        error!(error = %e, "Failed to register metrics");
    }

    let store = match RunStore::open(&cli.database) {
        Ok(store) => store,
        Err(e) => {
            error!(database = %cli.database, error = %e, "Failed to open catalog database");
            return ExitCode::FAILURE;
        }
    };
    let app = Arc::new(App::new(store));

    match cli.command {
        Some(Command::Server { port }) => {
            if let Err(e) = server::serve(app, port).await {
                error!(error = %e, "Server error");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        None => run_once(app, cli.run).await,
    }
}

/// Runs one ad-hoc load to completion and prints the aggregate. Exit code 0
/// only for a completed run.
async fn run_once(app: Arc<App>, args: RunArgs) -> ExitCode {
    let url = match args.url {
        Some(url) => url,
        None => {
            eprintln!("error: --url is required (or use the `server` subcommand)");
            return ExitCode::FAILURE;
        }
    };

    // The 100-request default applies only when no stop target was given at
    // all; an explicit --duration switches to duration mode.
    let requests = if args.requests.is_none() && args.duration.is_none() {
        Some(100)
    } else {
        args.requests
    };

    let request = RunRequest {
        url,
        method: args.method,
        users: args.users,
        requests,
        duration_secs: args.duration,
        body: args.body,
        content_type: Some(args.content_type),
        headers: None,
        insecure: args.insecure,
        auth: None,
    };

    // Subscribe before starting so no event of our own run can be missed.
    let mut subscription = app.subscribe();
    let token = match app.start_adhoc_run(&request) {
        Ok(token) => token,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    while let Some(event) = subscription.next().await {
        match event {
            StreamEvent::TestCompleted(aggregate) if aggregate.run_token == token => {
                AnsiWriter.write_results(&aggregate);
                return ExitCode::SUCCESS;
            }
            StreamEvent::TestError { run_token, error } if run_token == token => {
                eprintln!("error: run failed: {}", error);
                return ExitCode::FAILURE;
            }
            _ => {}
        }
    }

    eprintln!("error: event stream closed before the run finished");
    ExitCode::FAILURE
}
