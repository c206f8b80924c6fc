mod backend;
mod commands;
mod shutdown;
mod state;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::reconcile::ReconcileOptions;
use commands::{EXIT_FAILURE, EXIT_MANIFEST_ERROR, EXIT_RESOURCE_FAILED, EXIT_STATE_ERROR};
use state::StateStore;
use std::path::PathBuf;
use std::process::ExitCode;

const STATE_DIR_ENV: &str = "CONVERGE_STATE_DIR";
const DEFAULT_STATE_DIR: &str = "~/.local/state/converge";

#[derive(Debug, Parser)]
#[command(
    name = "converge",
    version,
    about = "Resumable reconciler for managed database resources"
)]
struct Cli {
    /// Directory holding in-flight operation records.
    /// Defaults to $CONVERGE_STATE_DIR, then ~/.local/state/converge.
    #[arg(long, global = true)]
    state_dir: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start or resume the operation that converges a resource on its manifest.
    Reconcile {
        /// Desired-state manifest.
        #[arg(long)]
        desired: PathBuf,
        /// Manifest the resource was last converged on.
        #[arg(long)]
        previous: Option<PathBuf>,
        /// Treat the desired manifest as a rollback to an earlier state.
        #[arg(long, default_value_t = false)]
        rollback: bool,
        /// Keep re-invoking after each resume delay until the operation ends.
        #[arg(long, default_value_t = false)]
        watch: bool,
        /// TOML table of error rules that take priority over the built-in ones.
        #[arg(long)]
        error_rules: Option<PathBuf>,
        /// Handler configuration (probing, stabilization attempts, delay).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Control-plane URL; overrides ~/.config/converge/remote.json.
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// List in-flight operations.
    Status,
    /// Forget the in-flight operation for a resource (e.g. db-instance/orders-db).
    Abandon { resource: String },
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
    /// Generate man pages into a directory.
    ManPages {
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CONVERGE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let state_dir = cli
        .state_dir
        .clone()
        .or_else(|| std::env::var(STATE_DIR_ENV).ok())
        .unwrap_or_else(|| DEFAULT_STATE_DIR.to_owned());
    let state_dir = expand_tilde(&state_dir);
    let store = StateStore::new(&state_dir);
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Reconcile {
            desired,
            previous,
            rollback,
            watch,
            error_rules,
            config,
            endpoint,
        } => commands::reconcile::run(
            store.dir(),
            &ReconcileOptions {
                desired,
                previous,
                rollback,
                watch,
                error_rules,
                config,
                endpoint,
            },
            json_output,
        ),
        Commands::Status => commands::status::run(&store, json_output),
        Commands::Abandon { resource } => commands::abandon::run(&store, &resource, json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("manifest error:") || msg.starts_with("config error:") {
        EXIT_MANIFEST_ERROR
    } else if msg.starts_with("state error:") || msg.starts_with("state lock:") {
        EXIT_STATE_ERROR
    } else if msg.starts_with("resource operation failed:") {
        EXIT_RESOURCE_FAILED
    } else {
        EXIT_FAILURE
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn error_prefixes_map_to_exit_codes() {
        assert_eq!(exit_code_for("manifest error: bad"), EXIT_MANIFEST_ERROR);
        assert_eq!(exit_code_for("config error: bad"), EXIT_MANIFEST_ERROR);
        assert_eq!(exit_code_for("state lock: busy"), EXIT_STATE_ERROR);
        assert_eq!(
            exit_code_for("resource operation failed: NotFound: gone"),
            EXIT_RESOURCE_FAILED
        );
        assert_eq!(exit_code_for("no operation in flight for 'x'"), EXIT_FAILURE);
    }

    #[test]
    fn tilde_expands_against_home() {
        let home = std::env::var("HOME").unwrap_or_default();
        if !home.is_empty() {
            assert_eq!(expand_tilde("~/x"), PathBuf::from(home).join("x"));
        }
        assert_eq!(expand_tilde("/abs"), PathBuf::from("/abs"));
    }
}
