use clap::{Parser, Subcommand};
use machine_timeline_core::Config;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "machine-timeline", version, about = "Machine timeline analysis CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Machine registry
    Machine {
        #[command(subcommand)]
        action: commands::machine::MachineAction,
    },
    /// Mode facts
    Fact {
        #[command(subcommand)]
        action: commands::fact::FactAction,
    },
    /// Controller auto-sequences
    Autoseq {
        #[command(subcommand)]
        action: commands::fact::AutoSequenceAction,
    },
    /// Modification queue
    Modification {
        #[command(subcommand)]
        action: commands::modification::ModificationAction,
    },
    /// Analysis passes
    Analyze {
        #[command(subcommand)]
        action: commands::analyze::AnalyzeAction,
    },
    /// Slots, summaries and machine status
    Report {
        #[command(subcommand)]
        action: commands::report::ReportAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

fn init_tracing() {
    let fallback = Config::load_or_default().logging.filter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing();
    let result = match cli.command {
        Commands::Machine { action } => commands::machine::run(action),
        Commands::Fact { action } => commands::fact::run_facts(action),
        Commands::Autoseq { action } => commands::fact::run_auto_sequences(action),
        Commands::Modification { action } => commands::modification::run(action),
        Commands::Analyze { action } => commands::analyze::run(action),
        Commands::Report { action } => commands::report::run(action),
        Commands::Config { action } => commands::config::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
