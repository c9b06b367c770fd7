//! gram-queue - Manage the publish queue
//!
//! Unix-style tool for feeding and inspecting the Gramcast queue. Ids and
//! JSON go to stdout, diagnostics to stderr.

use clap::{Args, Parser, Subcommand};
use libgramcast::logging::LoggingConfig;
use libgramcast::publishing::create_publisher;
use libgramcast::scheduling::{format_timestamp, parse_time};
use libgramcast::service::queue::EnqueueRequest;
use libgramcast::service::scheduled::{ScheduleRequest, UpdateScheduledPost};
use libgramcast::{
    Account, ActionType, Clock, Collaborators, Config, Database, GramcastError, GramcastService,
    MediaFile, Post, Priority, QueueItem, Result, ScheduledPost, SystemClock,
};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "gram-queue")]
#[command(version)]
#[command(about = "Manage the Gramcast publish queue")]
#[command(long_about = "\
gram-queue - Manage the Gramcast publish queue

DESCRIPTION:
    gram-queue registers accounts and media, queues posts and stories for
    rate-limited publishing, and manages caller-owned scheduled posts.
    Queued work is picked up by the gram-send daemon.

USAGE EXAMPLES:
    # Register an account and a post
    gram-queue account add acct-1 --owner alice --username gallery
    gram-queue post add --account acct-1 --media-ref https://cdn.example/1.jpg

    # Queue it for publishing as soon as the rate limit allows
    gram-queue enqueue acct-1 <POST_ID>

    # Queue a story for tomorrow morning
    gram-queue enqueue acct-1 <POST_ID> --kind story --at \"tomorrow 9am\"

    # Schedule a post owned by alice
    gram-queue schedule --owner alice acct-1 media-1 \"in 2h\" --caption \"Sunset\"

    # Re-dispatch anything whose callback was lost
    gram-queue sweep

TIME FORMATS:
    Unix seconds, RFC 3339, durations (\"30m\", \"in 2h\"), natural language
    (\"tomorrow 9am\")

CONFIGURATION:
    Configuration file: ~/.config/gramcast/config.toml
    Database location: ~/.local/share/gramcast/gramcast.db

    Override with environment variables:
        GRAMCAST_CONFIG    - Path to config file
        GRAMCAST_DB_PATH   - Path to database file
        GRAMCAST_OWNER     - Owner for scheduled-post commands

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database or configuration error
    3 - Invalid input (unknown id, bad time, wrong owner or state)
    4 - Rate limited
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register or change accounts
    #[command(subcommand)]
    Account(AccountCommand),

    /// Register media files
    #[command(subcommand)]
    Media(MediaCommand),

    /// Register posts
    #[command(subcommand)]
    Post(PostCommand),

    /// Queue a post for rate-limited publishing
    Enqueue {
        account_id: String,
        post_id: String,

        #[command(flatten)]
        kind: KindArg,

        /// Earliest publish time (default: now)
        #[arg(long)]
        at: Option<String>,

        /// high, normal or low
        #[arg(long, default_value = "normal")]
        priority: String,
    },

    /// Publish a post immediately, subject to the rate limit
    Now {
        account_id: String,
        post_id: String,

        #[command(flatten)]
        kind: KindArg,
    },

    /// List queue items for an account
    List {
        account_id: String,

        #[command(flatten)]
        format: FormatArg,
    },

    /// Show one queue item
    Status {
        queue_id: String,

        #[command(flatten)]
        format: FormatArg,
    },

    /// Cancel a pending queue item
    Cancel { queue_id: String },

    /// Schedule a post from registered media
    Schedule {
        #[command(flatten)]
        owner: OwnerArg,

        account_id: String,
        media_id: String,

        /// When to publish
        time: String,

        #[arg(long)]
        caption: Option<String>,

        #[command(flatten)]
        kind: KindArg,
    },

    /// Change the caption or time of a scheduled post
    Update {
        #[command(flatten)]
        owner: OwnerArg,

        id: String,

        #[arg(long)]
        caption: Option<String>,

        /// New publish time
        #[arg(long)]
        at: Option<String>,
    },

    /// Cancel a scheduled post
    Unschedule {
        #[command(flatten)]
        owner: OwnerArg,

        id: String,
    },

    /// List scheduled posts
    Scheduled {
        #[command(flatten)]
        owner: OwnerArg,

        /// Only this account
        #[arg(long)]
        account: Option<String>,

        #[command(flatten)]
        format: FormatArg,
    },

    /// Dispatch due queue items and scheduled posts whose callbacks were lost
    Sweep,
}

#[derive(Subcommand, Debug)]
enum AccountCommand {
    /// Add an account
    Add {
        id: String,

        #[arg(long)]
        owner: String,

        #[arg(long)]
        username: String,

        /// Register the account as inactive
        #[arg(long)]
        inactive: bool,
    },

    /// Mark an account active
    Activate { id: String },

    /// Mark an account inactive; its queued work fails at dispatch
    Deactivate { id: String },
}

#[derive(Subcommand, Debug)]
enum MediaCommand {
    /// Add a media file
    Add {
        id: String,

        #[arg(long)]
        owner: String,

        /// URL or path the publisher uploads from
        #[arg(long = "ref")]
        media_ref: String,
    },
}

#[derive(Subcommand, Debug)]
enum PostCommand {
    /// Add a post and print its id
    Add {
        #[arg(long)]
        account: String,

        #[arg(long)]
        media_ref: String,

        #[arg(long)]
        caption: Option<String>,

        /// Use this id instead of a generated one
        #[arg(long)]
        id: Option<String>,
    },
}

/// Caller identity for scheduled-post commands
#[derive(Args, Debug)]
struct OwnerArg {
    #[arg(long = "owner", env = "GRAMCAST_OWNER")]
    owner: String,
}

#[derive(Args, Debug)]
struct KindArg {
    /// post or story
    #[arg(long, default_value = "post")]
    kind: String,
}

#[derive(Args, Debug)]
struct FormatArg {
    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env("error", cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Arc::new(Database::new(&config.database.path).await?);
    tracing::debug!(path = %config.database.path, "Opened database");
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let publisher = create_publisher(&config.publisher)?;
    let service =
        GramcastService::new(&config, Collaborators::sqlite(db.clone(), publisher, clock.clone()));

    execute(&db, &service, clock.now(), cli.command).await
}

async fn cmd_account(db: &Database, cmd: AccountCommand) -> Result<()> {
    match cmd {
        AccountCommand::Add {
            id,
            owner,
            username,
            inactive,
        } => {
            db.create_account(&Account {
                id: id.clone(),
                owner_id: owner,
                username,
                is_active: !inactive,
            })
            .await?;
            println!("{}", id);
        }
        AccountCommand::Activate { id } => set_active(db, &id, true).await?,
        AccountCommand::Deactivate { id } => set_active(db, &id, false).await?,
    }
    Ok(())
}

async fn set_active(db: &Database, id: &str, active: bool) -> Result<()> {
    if !db.set_account_active(id, active).await? {
        return Err(GramcastError::NotFound(format!("Account {}", id)));
    }
    println!("{}", id);
    Ok(())
}

async fn execute(
    db: &Database,
    service: &GramcastService,
    now: i64,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::Account(cmd) => cmd_account(db, cmd).await?,
        Commands::Media(MediaCommand::Add {
            id,
            owner,
            media_ref,
        }) => {
            db.create_media(&MediaFile {
                id: id.clone(),
                owner_id: owner,
                media_ref,
            })
            .await?;
            println!("{}", id);
        }
        Commands::Post(PostCommand::Add {
            account,
            media_ref,
            caption,
            id,
        }) => {
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            db.create_post(&Post {
                id: id.clone(),
                account_id: account,
                media_ref,
                caption,
            })
            .await?;
            println!("{}", id);
        }
        Commands::Enqueue {
            account_id,
            post_id,
            kind,
            at,
            priority,
        } => {
            let requested_at = at.as_deref().map(|t| parse_time(t, now)).transpose()?;
            let item = service
                .queue()
                .enqueue(EnqueueRequest {
                    account_id,
                    post_id,
                    kind: parse_kind(&kind)?,
                    requested_at,
                    priority: priority.parse::<Priority>().map_err(GramcastError::InvalidInput)?,
                })
                .await?;
            println!("{}", item.id);
        }
        Commands::Now {
            account_id,
            post_id,
            kind,
        } => {
            let receipt = service
                .queue()
                .publish_now(&account_id, &post_id, parse_kind(&kind)?)
                .await?;
            println!("{}", receipt.external_media_id);
        }
        Commands::List { account_id, format } => {
            let items = service.queue().list_by_account(&account_id).await?;
            if json_output(&format)? {
                print_json(&items)?;
            } else {
                for item in &items {
                    println!("{}", queue_line(item, now));
                }
            }
        }
        Commands::Status { queue_id, format } => {
            let item = service.queue().get(&queue_id).await?;
            if json_output(&format)? {
                print_json(&item)?;
            } else {
                println!("{}", queue_line(&item, now));
                if let Some(error) = &item.error_message {
                    println!("last error: {}", error);
                }
            }
        }
        Commands::Cancel { queue_id } => {
            let item = service.queue().cancel(&queue_id).await?;
            println!("{}", item.id);
        }
        Commands::Schedule {
            owner,
            account_id,
            media_id,
            time,
            caption,
            kind,
        } => {
            let post = service
                .scheduled()
                .schedule(
                    &owner.owner,
                    ScheduleRequest {
                        account_id,
                        media_id,
                        caption,
                        scheduled_at: parse_time(&time, now)?,
                        kind: parse_kind(&kind)?,
                    },
                )
                .await?;
            println!("{}", post.id);
        }
        Commands::Update {
            owner,
            id,
            caption,
            at,
        } => {
            if caption.is_none() && at.is_none() {
                return Err(GramcastError::InvalidInput(
                    "Nothing to update; pass --caption and/or --at".to_string(),
                ));
            }
            let scheduled_at = at.as_deref().map(|t| parse_time(t, now)).transpose()?;
            let post = service
                .scheduled()
                .update(
                    &owner.owner,
                    &id,
                    UpdateScheduledPost {
                        caption,
                        scheduled_at,
                    },
                )
                .await?;
            println!("{}", post.id);
        }
        Commands::Unschedule { owner, id } => {
            let post = service.scheduled().cancel(&owner.owner, &id).await?;
            println!("{}", post.id);
        }
        Commands::Scheduled {
            owner,
            account,
            format,
        } => {
            let posts = service
                .scheduled()
                .list(&owner.owner, account.as_deref())
                .await?;
            if json_output(&format)? {
                print_json(&posts)?;
            } else {
                for post in &posts {
                    println!("{}", scheduled_line(post, now));
                }
            }
        }
        Commands::Sweep => {
            let report = service.sweep().await?;
            print_json(&report)?;
        }
    }
    Ok(())
}

fn parse_kind(arg: &KindArg) -> Result<ActionType> {
    arg.kind.parse().map_err(GramcastError::InvalidInput)
}

fn json_output(arg: &FormatArg) -> Result<bool> {
    match arg.format.as_str() {
        "json" => Ok(true),
        "text" => Ok(false),
        other => Err(GramcastError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            other
        ))),
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| GramcastError::InvalidInput(format!("Could not encode output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

fn queue_line(item: &QueueItem, now: i64) -> String {
    format!(
        "{} | {} | {} | {} | attempts {} | {}",
        item.id,
        item.queue_type,
        item.status,
        item.post_id,
        item.attempt_count,
        describe_time(now, item.scheduled_at)
    )
}

fn scheduled_line(post: &ScheduledPost, now: i64) -> String {
    let caption = post.caption.as_deref().map(|c| truncate(c, 40)).unwrap_or_default();
    format!(
        "{} | {} | {} | {} | {}",
        post.id,
        post.kind,
        post.status,
        describe_time(now, post.scheduled_at),
        caption
    )
}

fn truncate(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        let head: String = content.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}

/// "in 3 hours (2025-11-20T15:00:00+00:00)" style rendering
fn describe_time(now: i64, at: i64) -> String {
    let diff = at - now;
    let relative = if diff <= 0 {
        "due".to_string()
    } else {
        let minutes = diff / 60;
        let hours = minutes / 60;
        let days = hours / 24;

        if days > 0 {
            format!("in {} day{}", days, if days == 1 { "" } else { "s" })
        } else if hours > 0 {
            format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
        } else if minutes > 0 {
            format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
        } else {
            "in <1 minute".to_string()
        }
    };
    format!("{} ({})", relative, format_timestamp(at))
}
