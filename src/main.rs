//! ochopod agent - main entry point.

use clap::{Parser, Subcommand};
use ochopod::agent::EXIT_BINDING;
use ochopod::coord::MemoryStore;
use ochopod::lifecycle::{Piped, Reactive};
use ochopod::types::{ClusterView, CommandSpec};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "ochopod", version, about = "In-container coordination agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pod supervising the given command.
    Run {
        /// Command line to supervise.
        #[arg(long)]
        exec: String,
        /// Interpret the command through /bin/sh -c.
        #[arg(long)]
        shell: bool,
        /// Working directory for the child.
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Damper window in seconds.
        #[arg(long, default_value_t = 10.0)]
        damper: f64,
        /// Teardown grace in seconds.
        #[arg(long, default_value_t = 60.0)]
        grace: f64,
        /// Clusters this pod depends on (bare names, same namespace).
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
        /// Serialize leader control requests by ascending seq.
        #[arg(long)]
        sequential: bool,
        /// Reconfigure on every leader request.
        #[arg(long)]
        strict: bool,
        /// Exit the agent after an off request tears the child down.
        #[arg(long = "full-shutdown")]
        full_shutdown: bool,
        /// Restart budget before the pod goes failed.
        #[arg(long, default_value_t = 3)]
        checks: u32,
        /// Seconds between two sanity checks.
        #[arg(long = "check-every", default_value_t = 60.0)]
        check_every: f64,
    },
}

/// Hook assembled from the command line, for pods that are nothing more
/// than a supervised command.
struct ShellPod {
    exec: String,
    shell: bool,
    cwd: Option<PathBuf>,
    damper: Duration,
    grace: Duration,
    depends_on: Vec<String>,
    sequential: bool,
    strict: bool,
    full_shutdown: bool,
    checks: u32,
    check_every: Duration,
}

impl Reactive for ShellPod {
    fn damper(&self) -> Duration {
        self.damper
    }

    fn depends_on(&self) -> Vec<String> {
        self.depends_on.clone()
    }

    fn full_shutdown(&self) -> bool {
        self.full_shutdown
    }

    fn grace(&self) -> Duration {
        self.grace
    }

    fn sequential(&self) -> bool {
        self.sequential
    }
}

impl Piped for ShellPod {
    fn checks(&self) -> u32 {
        self.checks
    }

    fn check_every(&self) -> Duration {
        self.check_every
    }

    fn cwd(&self) -> Option<PathBuf> {
        self.cwd.clone()
    }

    fn shell(&self) -> bool {
        self.shell
    }

    fn strict(&self) -> bool {
        self.strict
    }

    fn configure(&self, _cluster: &ClusterView) -> ochopod::Result<CommandSpec> {
        Ok(CommandSpec::new(self.exec.clone()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            exec,
            shell,
            cwd,
            damper,
            grace,
            depends_on,
            sequential,
            strict,
            full_shutdown,
            checks,
            check_every,
        } => {
            let hook = Arc::new(ShellPod {
                exec,
                shell,
                cwd,
                damper: Duration::from_secs_f64(damper),
                grace: Duration::from_secs_f64(grace),
                depends_on,
                sequential,
                strict,
                full_shutdown,
                checks,
                check_every: Duration::from_secs_f64(check_every),
            });

            // The in-process store backs single-host runs; clustered
            // deployments plug an ensemble adapter in through the library.
            let store = Arc::new(MemoryStore::new());

            match ochopod::boot(hook, store).await {
                Ok(code) => std::process::exit(code),
                Err(err) => {
                    eprintln!("fatal: {}", err);
                    std::process::exit(EXIT_BINDING);
                }
            }
        }
    }
}
