use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use glance_core::ChallengePlan;
use tracing_subscriber::EnvFilter;

mod replay;

#[derive(Parser, Debug)]
#[command(name = "glance", version, about = "Glance active liveness CLI")]
struct Cli {
    #[arg(long, global = true, help = "Output machine-readable JSON")]
    json: bool,
    #[arg(
        long,
        global = true,
        help = "Talk to a daemon on the session bus instead of the system bus"
    )]
    session_bus: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a JSON Lines landmark trace through a local session
    Replay {
        /// Trace file, or `-` for stdin
        trace: PathBuf,
        #[arg(long, help = "Liveness thresholds TOML file")]
        config: Option<PathBuf>,
        #[arg(long, default_value = "attendance", help = "Challenge plan (attendance, presence)")]
        plan: String,
    },
    /// Show daemon status
    Status,
    /// Start a daemon session and print its id
    Start {
        #[arg(long, default_value = "attendance")]
        plan: String,
    },
    /// List open daemon sessions
    Sessions,
    /// Show the current state of a daemon session
    Snapshot {
        session: String,
    },
    /// Restart a daemon session from NO_FACE
    Reset {
        session: String,
    },
    /// End a daemon session and release it
    End {
        session: String,
    },
}

#[zbus::proxy(
    interface = "org.freedesktop.Glance1",
    default_service = "org.freedesktop.Glance1",
    default_path = "/org/freedesktop/Glance1"
)]
trait Glance {
    fn start_session(&self, plan: &str) -> zbus::Result<String>;
    fn snapshot(&self, session: &str) -> zbus::Result<String>;
    fn reset_session(&self, session: &str) -> zbus::Result<String>;
    fn end_session(&self, session: &str) -> zbus::Result<bool>;
    fn list_sessions(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

async fn connect(session_bus: bool) -> Result<GlanceProxy<'static>> {
    let conn = if session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    GlanceProxy::new(&conn)
        .await
        .context("failed to reach glanced (is the daemon running?)")
}

/// Print a JSON document returned by the daemon, pretty-printed.
fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_snapshot(raw: &str, json: bool) -> Result<()> {
    if json {
        return print_json(raw);
    }
    let snapshot: glance_core::Snapshot =
        serde_json::from_str(raw).context("daemon returned malformed snapshot")?;
    println!("phase:       {}", snapshot.phase);
    println!("instruction: {}", snapshot.instruction);
    println!("done:        {}", snapshot.done);
    println!("blocked:     {}", snapshot.blocked);
    println!("suspicion:   {}", snapshot.suspicion_score);
    Ok(())
}

fn run_replay(trace: PathBuf, config: Option<PathBuf>, plan: &str, json: bool) -> Result<()> {
    let config = replay::load_config(config.as_deref())?;
    let plan = ChallengePlan::from_name(plan)?;

    let report = if trace.as_os_str() == "-" {
        replay::replay(io::stdin().lock(), config, plan)?
    } else {
        let file = File::open(&trace)
            .with_context(|| format!("failed to open {}", trace.display()))?;
        replay::replay(BufReader::new(file), config, plan)?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", replay::render(&report));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            trace,
            config,
            plan,
        } => run_replay(trace, config, &plan, cli.json)?,
        Commands::Status => {
            let proxy = connect(cli.session_bus).await?;
            print_json(&proxy.status().await?)?;
        }
        Commands::Start { plan } => {
            let proxy = connect(cli.session_bus).await?;
            let id = proxy.start_session(&plan).await?;
            if cli.json {
                println!("{}", serde_json::json!({ "session": id }));
            } else {
                println!("{id}");
            }
        }
        Commands::Sessions => {
            let proxy = connect(cli.session_bus).await?;
            print_json(&proxy.list_sessions().await?)?;
        }
        Commands::Snapshot { session } => {
            let proxy = connect(cli.session_bus).await?;
            print_snapshot(&proxy.snapshot(&session).await?, cli.json)?;
        }
        Commands::Reset { session } => {
            let proxy = connect(cli.session_bus).await?;
            print_snapshot(&proxy.reset_session(&session).await?, cli.json)?;
        }
        Commands::End { session } => {
            let proxy = connect(cli.session_bus).await?;
            if !proxy.end_session(&session).await? {
                anyhow::bail!("unknown session '{session}'");
            }
            tracing::debug!(session, "session ended");
        }
    }

    Ok(())
}
