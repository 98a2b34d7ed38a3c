//! Clap derive structures for the `ctrlwire` CLI.
//!
//! Defines the command tree, global flags, and shared argument groups.

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// ctrlwire -- drive a building-management control platform from the shell
#[derive(Debug, Parser)]
#[command(
    name = "ctrlwire",
    version,
    about = "Control building-management platforms from the command line",
    long_about = "Authenticate against a control platform, bind to live module\n\
        variables, call module methods and query REST resources.\n\n\
        Use --mock to run everything against a built-in simulated system.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Platform profile to use
    #[arg(long, short = 'p', env = "CTRLWIRE_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Platform URL (overrides profile)
    #[arg(long, short = 'H', env = "CTRLWIRE_HOST", global = true)]
    pub host: Option<String>,

    /// Username for the password grant (overrides profile)
    #[arg(long, short = 'u', env = "CTRLWIRE_USERNAME", global = true, hide_env = true)]
    pub username: Option<String>,

    /// Use the built-in simulated backend
    #[arg(long, env = "CTRLWIRE_MOCK", global = true)]
    pub mock: bool,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "CTRLWIRE_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Accept self-signed TLS certificates
    #[arg(long, short = 'k', env = "CTRLWIRE_INSECURE", global = true)]
    pub insecure: bool,

    /// Request timeout in seconds
    #[arg(long, env = "CTRLWIRE_TIMEOUT", global = true)]
    pub timeout: Option<u64>,
}

// ── Output Enum ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show the platform's authorization authority
    Authority,

    /// Obtain an access token for the active profile
    Login(LoginArgs),

    /// Revoke the token, clear stored credentials and open the logout page
    Logout,

    /// Print the current access token
    Token,

    /// Bind to a module variable and print its value
    #[command(alias = "b")]
    Bind(BindArgs),

    /// Call a method on a module instance
    #[command(alias = "x")]
    Exec(ExecArgs),

    /// Stream a module's debug output
    Debug(DebugArgs),

    /// Query and operate on REST resources
    Rest(RestArgs),

    /// Walk through bind/exec against the simulated backend
    Demo(DemoArgs),

    /// Manage CLI configuration and profiles
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  AUTH
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct LoginArgs {
    /// Redirect URL the browser landed on after signing in
    #[arg(long)]
    pub callback: Option<String>,

    /// Application state to carry through the login redirect
    #[arg(long)]
    pub state: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  CONTROL CHANNEL
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A module instance: system id, module name and 1-based index.
#[derive(Debug, Args)]
pub struct ModuleTarget {
    /// System id
    pub system: String,

    /// Module name, optionally suffixed with its index (`Display_2`)
    pub module: String,

    /// Module index (overrides a suffix on the module name)
    #[arg(long, short = 'i')]
    pub index: Option<u32>,
}

#[derive(Debug, Args)]
pub struct BindArgs {
    #[command(flatten)]
    pub target: ModuleTarget,

    /// Variable name
    pub name: String,

    /// Keep printing changes until interrupted
    #[arg(long, short = 'w')]
    pub watch: bool,

    /// Stop after this many changes (implies --watch)
    #[arg(long, short = 'n')]
    pub count: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ExecArgs {
    #[command(flatten)]
    pub target: ModuleTarget,

    /// Method name
    pub method: String,

    /// Arguments, each parsed as JSON (bare words are sent as strings)
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(Debug, Args)]
pub struct DebugArgs {
    #[command(flatten)]
    pub target: ModuleTarget,

    /// Stop after this many log lines
    #[arg(long, short = 'n')]
    pub count: Option<usize>,
}

#[derive(Debug, Args)]
pub struct DemoArgs {
    /// Level to dim the demo light to
    #[arg(long, default_value = "40")]
    pub level: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  REST
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct RestArgs {
    #[command(subcommand)]
    pub command: RestCommand,
}

#[derive(Debug, Subcommand)]
pub enum RestCommand {
    /// List a collection (e.g. `systems`, `zones`)
    #[command(alias = "ls")]
    Query {
        /// Collection path
        path: String,

        /// Query parameter (repeatable)
        #[arg(long = "param", short = 'P', value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Follow pagination to the last page
        #[arg(long, short = 'a')]
        all: bool,
    },

    /// Show a single record
    Show {
        /// Collection path
        path: String,
        /// Record id
        id: String,
    },

    /// Create a record from a JSON body
    Create {
        /// Collection path
        path: String,
        /// JSON body
        #[arg(long, short = 'd')]
        data: String,
    },

    /// Update a record with a JSON body (PATCH unless --put)
    Update {
        /// Collection path
        path: String,
        /// Record id
        id: String,
        /// JSON body
        #[arg(long, short = 'd')]
        data: String,
        /// Replace the record with PUT
        #[arg(long)]
        put: bool,
    },

    /// Run a named task on a record
    Task {
        /// Collection path
        path: String,
        /// Record id
        id: String,
        /// Task name
        task: String,
        /// JSON arguments
        #[arg(long)]
        args: Option<String>,
    },

    /// Delete a record
    #[command(alias = "rm")]
    Remove {
        /// Collection path
        path: String,
        /// Record id
        id: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  CONFIG
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Create initial config file with guided setup
    Init,

    /// Display current configuration
    Show,

    /// Set a value on the active profile
    Set {
        /// Profile key (e.g., "host", "grant", "storage")
        key: String,

        /// Value to set
        value: String,
    },

    /// List configured profiles
    Profiles,

    /// Set the default profile
    Use {
        /// Profile name to set as default
        name: String,
    },

    /// Store a password in the system keyring
    SetPassword,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
