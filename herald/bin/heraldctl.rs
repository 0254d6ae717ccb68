//! Command-line utility for operating a herald queue
//!
//! - Inspect failed and sent messages
//! - Resend failed or dead-lettered messages
//! - Delete messages from the queue or the dead letters
//! - Enqueue a message and run a single delivery cycle

use std::{
    io::Read,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use herald::Services;
use herald_delivery::{
    DeadLetterRegistry, FailedFilter, FailedItem, FailedStatus, Page, PageRequest,
    ProviderRegistry, ResendOptions, SentFilter, SentItem,
};
use herald_queue::{MessageId, QueueStore, Recipient, RecipientClass, TimeWindow};
use serde::Serialize;

/// Command-line utility for operating a herald queue
#[derive(Parser, Debug)]
#[command(name = "heraldctl")]
#[command(about = "Inspect and repair the herald outbound queue", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to HERALD_CONFIG, then the standard locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Messages that failed at least once
    Failed {
        #[command(subcommand)]
        action: FailedAction,
    },
    /// Delivered messages
    Sent {
        #[command(subcommand)]
        action: SentAction,
    },
    /// Delete a message from the queue or the dead letters
    Delete {
        /// Message ID to delete
        id: MessageId,
    },
    /// Add a message to the queue
    Enqueue {
        #[command(flatten)]
        recipient: RecipientArgs,

        /// File holding the full RFC 822 message, or `-` for standard input
        #[arg(long)]
        body_file: PathBuf,
    },
    /// Run a single delivery cycle
    Flush,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct RecipientArgs {
    /// Deliver to this literal address
    #[arg(long)]
    to: Option<String>,

    /// Deliver to this user's current address (0 for userless)
    #[arg(long)]
    user: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum FailedAction {
    /// List failed and dead-lettered messages, newest first
    List {
        /// Only users with this language id
        #[arg(long)]
        lang: Option<u32>,

        /// Only users with this role
        #[arg(long)]
        role: Option<String>,

        /// Recipient classification: direct, user, userless or any
        #[arg(long, default_value = "any")]
        provider: String,

        /// any, failed or dead-lettered
        #[arg(long, default_value = "any")]
        status: FailedStatus,

        #[command(flatten)]
        window: WindowArgs,

        #[command(flatten)]
        page: PageArgs,
    },
    /// Enqueue fresh copies of failed messages
    Resend {
        /// Message IDs to resend
        ids: Vec<MessageId>,

        /// Comma-separated message IDs
        #[arg(long = "ids", value_delimiter = ',')]
        id_list: Vec<MessageId>,

        /// Leave the original in place
        #[arg(long)]
        keep_original: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SentAction {
    /// List delivered messages, most recently sent first
    List {
        /// Recipient address or numeric user id
        #[arg(long)]
        recipient: Option<String>,

        /// Recipient classification: direct, user, userless or any
        #[arg(long, default_value = "any")]
        provider: String,

        #[command(flatten)]
        window: WindowArgs,

        #[command(flatten)]
        page: PageArgs,
    },
}

#[derive(Args, Debug)]
struct WindowArgs {
    /// Start of the time window (RFC 3339)
    #[arg(long, value_parser = parse_timestamp)]
    from: Option<DateTime<Utc>>,

    /// End of the time window, inclusive (RFC 3339)
    #[arg(long, value_parser = parse_timestamp)]
    to: Option<DateTime<Utc>>,
}

impl WindowArgs {
    const fn window(&self) -> TimeWindow {
        TimeWindow {
            from: self.from,
            to: self.to,
        }
    }
}

#[derive(Args, Debug)]
struct PageArgs {
    /// Number of results to return
    #[arg(long, default_value = "50")]
    limit: usize,

    /// Starting offset for results
    #[arg(long, default_value = "0")]
    offset: usize,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    format: Format,
}

impl PageArgs {
    const fn request(&self) -> PageRequest {
        PageRequest {
            offset: self.offset,
            limit: self.limit,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 timestamp '{raw}': {e}"))
}

fn parse_class(raw: &str) -> anyhow::Result<Option<RecipientClass>> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("any") {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| anyhow::anyhow!("invalid provider '{raw}', expected direct, user, userless or any"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config_path = herald::config::find_config_file(cli.config.as_deref())?;
    let services = herald::config::load(&config_path)?.open(
        &ProviderRegistry::with_defaults(),
        &DeadLetterRegistry::with_defaults(),
    )?;

    match cli.command {
        Commands::Failed { action } => match action {
            FailedAction::List {
                lang,
                role,
                provider,
                status,
                window,
                page,
            } => {
                let filter = FailedFilter {
                    language: lang,
                    role,
                    class: parse_class(&provider)?,
                    status,
                    window: window.window(),
                };
                cmd_failed_list(&services, &filter, &page).await?;
            }
            FailedAction::Resend {
                mut ids,
                id_list,
                keep_original,
            } => {
                ids.extend(id_list);
                cmd_resend(&services, &ids, ResendOptions { keep_original }).await?;
            }
        },
        Commands::Sent {
            action:
                SentAction::List {
                    recipient,
                    provider,
                    window,
                    page,
                },
        } => {
            let filter = SentFilter {
                recipient,
                class: parse_class(&provider)?,
                window: window.window(),
            };
            cmd_sent_list(&services, &filter, &page).await?;
        }
        Commands::Delete { id } => {
            let source = services.replay().delete(id).await?;
            println!("Deleted message {id} from the {source}");
        }
        Commands::Enqueue {
            recipient,
            body_file,
        } => {
            cmd_enqueue(&services, recipient, &body_file).await?;
        }
        Commands::Flush => {
            let report = services.dispatcher()?.run_cycle().await?;
            println!("{report}");
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn print_footer<T>(page: &Page<T>) {
    let shown = page.items.len();
    if shown == 0 {
        println!("\nTotal: {} message(s)", page.total);
    } else {
        println!(
            "\nShowing {}-{} of {} message(s)",
            page.offset + 1,
            page.offset + shown,
            page.total
        );
    }
}

async fn cmd_failed_list(services: &Services, filter: &FailedFilter, args: &PageArgs) -> anyhow::Result<()> {
    let page = services.replay().list_failed(filter, args.request()).await?;

    if args.format == Format::Json {
        return print_json(&page);
    }

    println!(
        "{:<8} {:<12} {:<9} {:<7} {:<20} {:<36} SUBJECT",
        "ID", "SOURCE", "CLASS", "ERRORS", "CREATED", "RECIPIENT"
    );
    println!("{}", "-".repeat(110));
    for FailedItem {
        id,
        source,
        class,
        recipient,
        subject,
        created_at,
        error_count,
        last_error,
        reason,
        ..
    } in &page.items
    {
        println!(
            "{:<8} {:<12} {:<9} {error_count:<7} {:<20} {recipient:<36} {}",
            id.to_string(),
            source.as_str(),
            class.as_str(),
            format_time(*created_at),
            subject.as_deref().unwrap_or("-"),
        );
        if let Some(error) = last_error {
            match reason {
                Some(reason) => println!("         {reason}: {error}"),
                None => println!("         {error}"),
            }
        }
    }
    print_footer(&page);

    Ok(())
}

async fn cmd_sent_list(services: &Services, filter: &SentFilter, args: &PageArgs) -> anyhow::Result<()> {
    let page = services.replay().list_sent(filter, args.request()).await?;

    if args.format == Format::Json {
        return print_json(&page);
    }

    println!(
        "{:<8} {:<9} {:<20} {:<7} {:<36} SUBJECT",
        "ID", "CLASS", "SENT", "ERRORS", "RECIPIENT"
    );
    println!("{}", "-".repeat(100));
    for SentItem {
        id,
        class,
        recipient,
        subject,
        sent_at,
        error_count,
        ..
    } in &page.items
    {
        println!(
            "{:<8} {:<9} {:<20} {error_count:<7} {recipient:<36} {}",
            id.to_string(),
            class.as_str(),
            format_time(*sent_at),
            subject.as_deref().unwrap_or("-"),
        );
    }
    print_footer(&page);

    Ok(())
}

async fn cmd_resend(services: &Services, ids: &[MessageId], options: ResendOptions) -> anyhow::Result<()> {
    let outcome = services.replay().resend(ids, options).await?;
    for resent in &outcome.resent {
        println!("Resent {} as {}", resent.original, resent.new);
    }
    println!("{} message(s) resent", outcome.count);
    Ok(())
}

async fn cmd_enqueue(services: &Services, recipient: RecipientArgs, body_file: &Path) -> anyhow::Result<()> {
    let recipient = match (recipient.to, recipient.user) {
        (Some(address), _) => Recipient::direct(address),
        (None, Some(user)) => Recipient::user(user),
        (None, None) => anyhow::bail!("one of --to or --user is required"),
    };

    let body = if body_file.as_os_str() == "-" {
        let mut body = String::new();
        std::io::stdin().read_to_string(&mut body)?;
        body
    } else {
        std::fs::read_to_string(body_file)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", body_file.display()))?
    };
    if body.trim().is_empty() {
        anyhow::bail!("message body is empty");
    }

    let id = services.store.enqueue(recipient, body).await?;
    println!("Enqueued message {id}");
    Ok(())
}
