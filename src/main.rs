use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use colored::Colorize;
use inkgate::cli::{self, decide::DecideArgs, log::LogCommands, run::RunArgs, Target};
use inkgate::Result;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "inkgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Human-gated, versioned-state workflow engine", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Workspace root holding inkgate.toml and projects/
    #[arg(short, long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Project to operate on (defaults to the only project)
    #[arg(short, long, global = true)]
    project: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the workspace config and a project skeleton
    Init {
        /// Brief to seed the materials draft from
        #[arg(short, long)]
        brief: Option<PathBuf>,
    },

    /// Drive materials, proposals and units until done or waiting on a gate
    Run(RunArgs),

    /// Show cycles, open gates and proposals
    Status {
        #[arg(short, long)]
        json: bool,
    },

    /// Answer an open gate
    Decide(DecideArgs),

    /// Submit a change proposal against the current frozen materials
    Propose {
        /// YAML or JSON file with what, why, impact, migration_plan and evidence
        file: PathBuf,
    },

    /// Audit log maintenance
    #[command(subcommand)]
    Log(LogCommands),

    /// Copy a run into its stage archive
    Archive {
        /// Run directory name (defaults to the latest run)
        run: Option<String>,

        /// Confirm the archive
        #[arg(short, long)]
        yes: bool,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli) {
        eprintln!("{}", format!("Error: {:#}", e).red());
        std::process::exit(1);
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { brief } => {
            let Some(project) = cli.project.as_deref() else {
                anyhow::bail!("init needs --project <name>");
            };
            println!("{}", "🚀 Initializing inkgate...".cyan());
            cli::init::run(&cli.workspace, project, brief.as_deref())?;
        }

        Commands::Run(args) => {
            let target = Target::open(&cli.workspace, cli.project.as_deref())?;
            cli::run::run(&target, args)?;
        }

        Commands::Status { json } => {
            let target = Target::open(&cli.workspace, cli.project.as_deref())?;
            cli::status::run(&target, json)?;
        }

        Commands::Decide(args) => {
            let target = Target::open(&cli.workspace, cli.project.as_deref())?;
            cli::decide::run(&target, args)?;
        }

        Commands::Propose { file } => {
            let target = Target::open(&cli.workspace, cli.project.as_deref())?;
            cli::propose::run(&target, &file)?;
        }

        Commands::Log(cmd) => {
            let target = Target::open(&cli.workspace, cli.project.as_deref())?;
            cli::log::run(&target, cmd)?;
        }

        Commands::Archive { run, yes } => {
            let target = Target::open(&cli.workspace, cli.project.as_deref())?;
            cli::archive::run(&target, run.as_deref(), yes)?;
        }

        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "inkgate", &mut io::stdout());
        }
    }

    Ok(())
}
