use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};

use ssh_swap::profile::{self, DEFAULT_HOST, ProfileOverrides, SwapProfile};
use ssh_swap::ssh_config::CredentialIntent;
use ssh_swap::switcher::{CredentialSwitcher, set_host};

#[derive(Parser)]
#[command(
    name = "ssh-swap",
    about = "Swap the SSH identity for a host, run something, swap it back.",
    long_about = "ssh-swap rewrites the IdentityFile and User of a host in your SSH config.\n\
                  Use `set` for a one-off change, or `run` to switch to your primary identity\n\
                  for the lifetime of a command and fall back afterwards.",
    version
)]
struct Cli {
    /// Path to SSH config file
    #[arg(long, global = true, default_value = "~/.ssh/config")]
    config: String,

    /// Log more (repeat for more detail). RUST_LOG overrides this.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set the identity file and/or user for a host, then exit
    Set {
        /// Host to rewrite (matched against Host patterns)
        #[arg(long, default_value = DEFAULT_HOST)]
        host: String,

        /// Identity file to use (empty leaves it unchanged)
        #[arg(short, long, default_value = "")]
        identity_file: String,

        /// SSH user (empty leaves it unchanged)
        #[arg(short, long, default_value = "")]
        user: String,
    },
    /// Run a command with the primary identity, then switch to the fallback
    Run {
        /// Profile with primary_*/fallback_* identities (default: ~/.ssh-swap/profile)
        #[arg(long)]
        profile: Option<String>,

        /// Host to rewrite
        #[arg(long)]
        host: Option<String>,

        /// Primary identity file
        #[arg(short, long)]
        identity_file: Option<String>,

        /// Primary user
        #[arg(short, long)]
        user: Option<String>,

        /// Identity file restored afterwards
        #[arg(long)]
        fallback_identity_file: Option<String>,

        /// User restored afterwards
        #[arg(long)]
        fallback_user: Option<String>,

        /// Switch back as soon as the command has started instead of when it exits
        #[arg(long)]
        revert_after_start: bool,

        /// Command and arguments to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
    /// Generate shell completions
    Completions {
        shell: Shell,
    },
}

fn resolve_path(path: &str) -> Result<PathBuf> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(rest))
    } else {
        Ok(PathBuf::from(path))
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .parse_default_env()
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "ssh-swap", &mut std::io::stdout());
            Ok(0)
        }
        Commands::Set {
            host,
            identity_file,
            user,
        } => {
            let config_path = resolve_path(&cli.config)?;
            set_host(&config_path, &host, &CredentialIntent::new(identity_file, user))?;
            Ok(0)
        }
        Commands::Run {
            profile: profile_arg,
            host,
            identity_file,
            user,
            fallback_identity_file,
            fallback_user,
            revert_after_start,
            command,
        } => {
            let profile_path = match profile_arg {
                Some(path) => resolve_path(&path)?,
                None => profile::default_path().context("Could not determine home directory")?,
            };
            let mut swap_profile = SwapProfile::load(&profile_path)
                .with_context(|| format!("reading profile {}", profile_path.display()))?;
            swap_profile.apply(ProfileOverrides {
                host,
                identity_file,
                user,
                fallback_identity_file,
                fallback_user,
            });
            // Fail before touching the config if either identity is incomplete
            swap_profile.validate()?;

            let config_path = resolve_path(&cli.config)?;
            let switcher = CredentialSwitcher::new(config_path, swap_profile.host.clone());
            handle_run(&switcher, &swap_profile, revert_after_start, &command).await
        }
    }
}

#[cfg(unix)]
async fn handle_run(
    switcher: &CredentialSwitcher,
    swap_profile: &SwapProfile,
    revert_after_start: bool,
    argv: &[String],
) -> Result<i32> {
    use ssh_swap::supervisor::{
        ExitOutcome, RevertPoint, SignalSubscription, Supervisor, SupervisorError,
    };

    let (program, args) = argv.split_first().context("no command given")?;

    // Listen first: a signal arriving once the primary identity is in place is queued
    // for the child instead of killing us before the fallback goes back
    let signals = SignalSubscription::subscribe().map_err(SupervisorError::Subscribe)?;
    switcher.switch_to(&swap_profile.primary)?;
    log::info!(
        "Primary identity installed for {} in {}",
        switcher.host(),
        switcher.config_path().display()
    );

    let mut command = tokio::process::Command::new(program);
    command.args(args);
    let revert_point = if revert_after_start {
        RevertPoint::AfterStart
    } else {
        RevertPoint::OnExit
    };

    let outcome = Supervisor::new()
        .revert_point(revert_point)
        .run_with_signals(command, signals, || {
            switcher.switch_to(&swap_profile.fallback)?;
            Ok(())
        })
        .await?;

    if outcome == ExitOutcome::Unknown {
        eprintln!("Error running {}: unknown failure", program);
    }
    Ok(outcome.exit_code())
}

#[cfg(not(unix))]
async fn handle_run(
    _switcher: &CredentialSwitcher,
    _swap_profile: &SwapProfile,
    _revert_after_start: bool,
    _argv: &[String],
) -> Result<i32> {
    anyhow::bail!("running a command: only supported on unix")
}
