//! chatd - real-time chat server
//!
//! One dispatcher thread multiplexes every client socket; a fixed pool of
//! workers each keeps one pipelined PostgreSQL connection busy.
//!
//! Usage:
//!     cargo build --release -p chatd
//!     psql -d chat -f sql/schema.sql
//!     ./target/release/chatd -p 8080 -d "dbname=chat user=chat"
//!
//! Settings come from `config.json` (or `-f <file>`), then `CHATD_*`
//! environment variables, then the command line. `CHATD_LOG` takes a
//! full tracing filter and overrides `log_level`.

use std::process::ExitCode;
use std::sync::Arc;

use chatd_pg::PgDriver;
use chatd_pipeline::{PipelineDriver, PipelineError};
use chatd_server::sys::SignalFd;
use chatd_server::{CliArgs, DriverFactory, Server, ServerConfig, USAGE};
use tracing::{error, info};

fn main() -> ExitCode {
    let cli = match CliArgs::parse(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("chatd: {e}\n{USAGE}");
            return ExitCode::from(2);
        }
    };
    if cli.help {
        println!("{USAGE}");
        return ExitCode::SUCCESS;
    }

    let config = match ServerConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("chatd: {e}");
            return ExitCode::from(2);
        }
    };
    chatd_core::log::init(Some(&config.log_level));

    match serve(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

fn serve(config: ServerConfig) -> chatd_server::Result<()> {
    // Block SIGINT/SIGTERM before any thread exists so every thread
    // inherits the mask and the signalfd sees them.
    let signals = SignalFd::termination()?;

    let conninfo = config.database.clone();
    info!(
        workers = config.workers,
        root = %config.root_dir.display(),
        "starting chatd"
    );
    let server = Server::new(config)?;
    server.bind()?;
    server.watch_signals(signals)?;

    let factory: DriverFactory = Arc::new(move || {
        let driver = PgDriver::connect(&conninfo).map_err(PipelineError::from)?;
        info!(pid = driver.backend_pid(), "database connected");
        Ok(Box::new(driver) as Box<dyn PipelineDriver>)
    });
    server.run(factory)
}
