use std::path::PathBuf;

use clap::{Parser, Subcommand};
use keyflag_core::Decision;

mod commands;

use commands::{Context, OutputFormat};

#[derive(Parser)]
#[command(
    name = "keyflag",
    about = "keyflag: governed configuration keys with canary rollout",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Config file (default: ./keyflag.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Override [store].path from the config file
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// Output format: text or json
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Propose a new value for a key
    Propose {
        key: String,
        value: String,
        #[arg(short = 't', long = "type", default_value = "string")]
        value_type: String,
        /// Proposing user id
        #[arg(short, long)]
        user: u64,
    },
    /// Propose deleting a key
    ProposeDelete {
        key: String,
        #[arg(short = 't', long = "type", default_value = "string")]
        value_type: String,
        #[arg(short, long)]
        user: u64,
    },
    /// Accept or reject the pending update (or canary) of a key
    Approve {
        key: String,
        /// Approving user id
        #[arg(short, long)]
        user: u64,
        /// accept or reject
        #[arg(short, long, default_value = "accept")]
        decision: Decision,
    },
    /// Accept or reject the pending delete of a key
    ApproveDelete {
        key: String,
        #[arg(short, long)]
        user: u64,
        #[arg(short, long, default_value = "accept")]
        decision: Decision,
    },
    /// Expire a record immediately, bypassing approval
    Retire {
        record_id: u64,
        #[arg(short, long)]
        user: u64,
    },
    /// Show the value served for a key
    Get { key: String },
    /// Show every served value under a prefix
    List {
        #[arg(default_value = "")]
        prefix: String,
        /// Apply canary overrides targeted at this host
        #[arg(long, default_value = "")]
        host: String,
    },
    /// Show proposals awaiting approval
    Pending {
        #[arg(default_value = "")]
        prefix: String,
        /// Include pending deletes alongside pending updates
        #[arg(long)]
        all: bool,
    },
    /// Show the record history of a key
    History {
        key: String,
        /// Treat KEY as a prefix
        #[arg(long)]
        prefix: bool,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// List key paths under a prefix
    Browse {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Manage canary rollouts
    Canary {
        #[command(subcommand)]
        action: CanaryAction,
    },
    /// Onboard a service: default key, roles and lead grant
    BootstrapService {
        tribe: String,
        service: String,
        /// Owning username
        #[arg(short, long)]
        user: String,
    },
    /// Manage user accounts
    User {
        #[command(subcommand)]
        action: UserAction,
    },
}

#[derive(Subcommand)]
enum CanaryAction {
    /// Start a canary from the pending update of a key, or add hosts to it
    Start {
        key: String,
        #[arg(short, long)]
        user: u64,
        #[arg(short, long, default_value = "accept")]
        decision: Decision,
        /// Target hosts (repeatable)
        #[arg(long = "host")]
        hosts: Vec<String>,
    },
    /// Show enabled and recommended hosts of a canary record
    Status { record_id: u64 },
    /// Register the hosts running the newest build of a service
    Register {
        service: String,
        #[arg(long = "host", required = true)]
        hosts: Vec<String>,
    },
    /// Forget the registered hosts of a service
    Release { service: String },
}

#[derive(Subcommand)]
enum UserAction {
    /// Create a user (no-op if the username exists)
    Add {
        username: String,
        #[arg(short, long, default_value = "")]
        email: String,
    },
    /// Look up a user by name
    Show { username: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = commands::load_config(cli.config.as_deref(), cli.store)?;
    commands::init_tracing(&config.log)?;
    let ctx = Context::open(&config, cli.format)?;

    match cli.command {
        Commands::Propose {
            key,
            value,
            value_type,
            user,
        } => commands::keys::propose(&ctx, &key, &value, &value_type, user),
        Commands::ProposeDelete {
            key,
            value_type,
            user,
        } => commands::keys::propose_delete(&ctx, &key, &value_type, user),
        Commands::Approve {
            key,
            user,
            decision,
        } => commands::keys::approve(&ctx, &key, user, decision),
        Commands::ApproveDelete {
            key,
            user,
            decision,
        } => commands::keys::approve_delete(&ctx, &key, user, decision),
        Commands::Retire { record_id, user } => commands::keys::retire(&ctx, record_id, user),
        Commands::Get { key } => commands::keys::get(&ctx, &key),
        Commands::List { prefix, host } => commands::keys::list(&ctx, &prefix, &host),
        Commands::Pending { prefix, all } => commands::keys::pending(&ctx, &prefix, all),
        Commands::History { key, prefix, limit } => {
            commands::keys::history(&ctx, &key, prefix, limit)
        }
        Commands::Browse { prefix } => commands::keys::browse(&ctx, &prefix),
        Commands::Canary { action } => match action {
            CanaryAction::Start {
                key,
                user,
                decision,
                hosts,
            } => commands::canary::start(&ctx, &key, user, decision, &hosts),
            CanaryAction::Status { record_id } => commands::canary::status(&ctx, record_id),
            CanaryAction::Register { service, hosts } => {
                commands::canary::register(&ctx, &service, &hosts)
            }
            CanaryAction::Release { service } => commands::canary::release(&ctx, &service),
        },
        Commands::BootstrapService {
            tribe,
            service,
            user,
        } => commands::service::bootstrap(&ctx, &user, &tribe, &service),
        Commands::User { action } => match action {
            UserAction::Add { username, email } => {
                commands::service::add_user(&ctx, &username, &email)
            }
            UserAction::Show { username } => commands::service::show_user(&ctx, &username),
        },
    }
}
