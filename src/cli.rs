use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "sesmail")]
#[command(about = "Bulk email through Amazon SES with send history", long_about = None)]
pub struct Cli {
    /// Settings file (defaults to $SESMAIL_CONFIG, then settings.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database file, overriding the settings and $DATABASE_URL
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Send an email to a recipient list in batches
    Send(SendArgs),
    /// List campaigns, most recently sent first
    History {
        /// Only campaigns whose subject or sender contains this text
        #[arg(long)]
        search: Option<String>,
    },
    /// Show one campaign with its sent and failed records
    Show { campaign_id: String },
    /// Overall sending statistics and database row counts
    Stats,
    /// Split a recipient list into already-sent and new addresses
    Compare {
        /// CSV file with a header row
        recipients: PathBuf,
        /// Zero-based column holding the addresses
        #[arg(long, default_value_t = 0)]
        column: usize,
        /// Compare against one campaign instead of all history
        #[arg(long)]
        campaign: Option<String>,
        /// Print the addresses, not only the counts
        #[arg(long)]
        list: bool,
    },
    /// Manage saved drafts
    Drafts {
        #[command(subcommand)]
        command: DraftCommands,
    },
    /// Flag failed records as handled
    MarkRetried {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    /// Database maintenance
    Migrate {
        /// Merge duplicate templates into their oldest copy
        #[arg(long)]
        consolidate: bool,
        /// Show what would change without writing
        #[arg(long)]
        dry_run: bool,
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
    /// Check settings and database
    Check,
}

#[derive(Debug, Args)]
pub struct SendArgs {
    /// CSV file with a header row
    #[arg(long)]
    pub recipients: Option<PathBuf>,
    /// Zero-based address column (defaults to the last one used)
    #[arg(long)]
    pub column: Option<usize>,
    /// Additional recipient, may be repeated
    #[arg(long = "to")]
    pub extra_recipients: Vec<String>,
    /// Send to the configured test recipients instead
    #[arg(long)]
    pub test: bool,
    /// Start from a saved draft
    #[arg(long)]
    pub draft: Option<i64>,
    #[arg(long)]
    pub subject: Option<String>,
    #[arg(long, conflicts_with = "body_file")]
    pub body: Option<String>,
    #[arg(long)]
    pub body_file: Option<PathBuf>,
    /// Send as text/plain instead of HTML
    #[arg(long)]
    pub plain: bool,
    /// Attachment path, may be repeated; bare names are looked up in the files directory
    #[arg(long = "attach")]
    pub attachments: Vec<PathBuf>,
    /// Leave out addresses that already received any email
    #[arg(long)]
    pub skip_sent: bool,
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Seconds between batches
    #[arg(long)]
    pub delay: Option<f64>,
    /// Put recipients in To instead of Bcc
    #[arg(long)]
    pub no_bcc: bool,
    /// Retry the failed recipients once after the run
    #[arg(long)]
    pub retry_failed: bool,
    /// Write the failed recipients to this CSV file
    #[arg(long)]
    pub export_failed: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum DraftCommands {
    List,
    Show {
        id: i64,
    },
    Create {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        subject: String,
        #[arg(long)]
        body_file: Option<PathBuf>,
        #[arg(long, default_value = "")]
        sender: String,
        /// Comma-separated addresses
        #[arg(long, default_value = "")]
        recipients: String,
        #[arg(long = "attach")]
        attachments: Vec<String>,
        #[arg(long)]
        plain: bool,
    },
    /// Change fields, e.g. --set subject=Hello --set email_type=plain
    Update {
        id: i64,
        #[arg(long = "set", value_name = "FIELD=VALUE", required = true)]
        fields: Vec<String>,
    },
    Delete {
        id: i64,
    },
}
