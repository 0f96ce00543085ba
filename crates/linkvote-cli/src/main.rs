use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use linkvote_api::{
    AddCommentRequest, CreateUserRequest, LinkVoteApi, UpdateCommentRequest, VoteRequest,
};
use linkvote_core::{CommentId, LinkDraft, LinkId, UserId, VoteKind};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "lv")]
#[command(about = "LinkVote CLI")]
struct Cli {
    #[arg(long, env = "LINKVOTE_DB", default_value = "./linkvote.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    User {
        #[command(subcommand)]
        command: Box<UserCommand>,
    },
    Link {
        #[command(subcommand)]
        command: Box<LinkCommand>,
    },
    Comment {
        #[command(subcommand)]
        command: Box<CommentCommand>,
    },
    Vote {
        #[command(subcommand)]
        command: Box<VoteCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    Add {
        #[arg(long)]
        name: String,
    },
    Show {
        #[arg(long)]
        user: UserId,
    },
}

#[derive(Debug, Args)]
struct LinkFields {
    #[arg(long)]
    title: String,
    #[arg(long)]
    url: String,
    #[arg(long)]
    description: Option<String>,
}

impl From<LinkFields> for LinkDraft {
    fn from(fields: LinkFields) -> Self {
        Self { title: fields.title, url: fields.url, description: fields.description }
    }
}

#[derive(Debug, Subcommand)]
enum LinkCommand {
    Add {
        #[arg(long)]
        user: UserId,
        #[command(flatten)]
        fields: LinkFields,
    },
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    Show {
        #[arg(long)]
        link: LinkId,
        /// Report this user's stance alongside the link.
        #[arg(long)]
        user: Option<UserId>,
    },
    Edit {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        link: LinkId,
        #[command(flatten)]
        fields: LinkFields,
    },
    Delete {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        link: LinkId,
    },
}

#[derive(Debug, Subcommand)]
enum CommentCommand {
    Add {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        link: LinkId,
        #[arg(long)]
        content: String,
        #[arg(long)]
        parent: Option<CommentId>,
    },
    Edit {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        comment: CommentId,
        #[arg(long)]
        content: String,
    },
    Delete {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        comment: CommentId,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VoteKindArg {
    Up,
    Down,
}

impl From<VoteKindArg> for VoteKind {
    fn from(value: VoteKindArg) -> Self {
        match value {
            VoteKindArg::Up => Self::Up,
            VoteKindArg::Down => Self::Down,
        }
    }
}

#[derive(Debug, Subcommand)]
enum VoteCommand {
    Cast {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        link: LinkId,
        #[arg(long, value_enum)]
        kind: VoteKindArg,
    },
    Score {
        #[arg(long)]
        link: LinkId,
    },
    Show {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        link: LinkId,
    },
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(data: &T) -> Result<()> {
    emit_json(serde_json::to_value(data).context("failed to serialize command output")?)
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let api = LinkVoteApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::User { command } => run_user(*command, &api),
        Command::Link { command } => run_link(*command, &api),
        Command::Comment { command } => run_comment(*command, &api),
        Command::Vote { command } => run_vote(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &LinkVoteApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::Backup(args) => {
            let result = api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": result.path,
                "schema_version": result.schema_version,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            let status = api.restore(&args.input)?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?),
    }
}

fn run_user(command: UserCommand, api: &LinkVoteApi) -> Result<()> {
    match command {
        UserCommand::Add { name } => emit(&api.create_user(&CreateUserRequest { name })?),
        UserCommand::Show { user } => emit(&api.get_user(user)?),
    }
}

fn run_link(command: LinkCommand, api: &LinkVoteApi) -> Result<()> {
    match command {
        LinkCommand::Add { user, fields } => emit(&api.create_link(user, &fields.into())?),
        LinkCommand::List { page } => emit(&api.list_links(page)?),
        LinkCommand::Show { link, user } => emit(&api.link_detail(link, user)?),
        LinkCommand::Edit { user, link, fields } => {
            emit(&api.update_link(user, link, &fields.into())?)
        }
        LinkCommand::Delete { user, link } => emit(&api.delete_link(user, link)?),
    }
}

fn run_comment(command: CommentCommand, api: &LinkVoteApi) -> Result<()> {
    match command {
        CommentCommand::Add { user, link, content, parent } => {
            let request = AddCommentRequest { content, parent_id: parent };
            emit(&api.add_comment(user, link, &request)?)
        }
        CommentCommand::Edit { user, comment, content } => {
            emit(&api.update_comment(user, comment, &UpdateCommentRequest { content })?)
        }
        CommentCommand::Delete { user, comment } => emit(&api.delete_comment(user, comment)?),
    }
}

fn run_vote(command: VoteCommand, api: &LinkVoteApi) -> Result<()> {
    match command {
        VoteCommand::Cast { user, link, kind } => {
            emit(&api.vote(user, link, &VoteRequest { kind: kind.into() })?)
        }
        VoteCommand::Score { link } => {
            let tally = api.score(link)?;
            emit_json(serde_json::json!({
                "link_id": link,
                "upvotes": tally.upvotes,
                "downvotes": tally.downvotes,
                "net_score": tally.net_score
            }))
        }
        VoteCommand::Show { user, link } => emit(&api.user_vote(user, link)?),
    }
}
