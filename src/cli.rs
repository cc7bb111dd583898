use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "converge")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Plan and apply a declarative resource graph", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Project file (default: ./converge.toml)
    #[arg(short, long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Check the project file and the dependency graph
    Validate,

    /// Show what apply would change
    Plan(PlanArgs),

    /// Converge remote objects to the project file
    Apply(ApplyArgs),

    /// Delete every object recorded in state
    Destroy(DestroyArgs),

    /// Reconcile state with remote objects without changing them
    Refresh(RefreshArgs),

    /// Print the resolved dependency graph
    Graph(GraphArgs),

    /// Inspect or edit recorded state
    #[command(subcommand)]
    State(StateCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Plan / Apply
// ============================================================================

#[derive(Args)]
pub struct PlanArgs {
    /// Limit to resources (kind.name or kind) and their dependencies
    #[arg(short, long = "target", value_name = "TARGET")]
    pub targets: Vec<String>,

    /// Read every recorded object before planning
    #[arg(long)]
    pub refresh: bool,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Limit to resources (kind.name or kind) and their dependencies
    #[arg(short, long = "target", value_name = "TARGET")]
    pub targets: Vec<String>,

    /// Read every recorded object before planning
    #[arg(long)]
    pub refresh: bool,

    /// Number of parallel provider calls
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Per-action timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Args)]
pub struct DestroyArgs {
    /// Limit to resources (kind.name or kind) and everything depending on them
    #[arg(short, long = "target", value_name = "TARGET")]
    pub targets: Vec<String>,

    /// Number of parallel provider calls
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Args)]
pub struct RefreshArgs {
    /// Record drifted remote values as the new state instead of reporting conflicts
    #[arg(long)]
    pub accept: bool,
}

#[derive(Args)]
pub struct GraphArgs {
    /// Emit Graphviz DOT
    #[arg(long)]
    pub dot: bool,
}

// ============================================================================
// State
// ============================================================================

#[derive(Subcommand)]
pub enum StateCommand {
    /// List recorded resources
    List,

    /// Show one record
    Show {
        /// Resource identifier (kind.name)
        id: String,
    },

    /// Forget a record without deleting the remote object
    Rm {
        /// Resource identifier (kind.name)
        id: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}
