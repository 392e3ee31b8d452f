mod cli;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use cli::{Cli, Commands, DraftCommands, SendArgs};
use sesmail::compare::{CompareScope, compare};
use sesmail::config::AppConfig;
use sesmail::drafts::{DraftField, DraftPatch, NewDraft};
use sesmail::history;
use sesmail::message::{Composition, SenderProfile};
use sesmail::provider::SesProvider;
use sesmail::recipients::{dedupe, export_failed, partition_valid, read_column};
use sesmail::sender::{
    BatchSettings, RetryPolicy, SendRequest, SendSession, SendState, TracingSink,
};
use sesmail::storage::{SqliteStorage, Storage};
use sesmail::types::{EmailType, split_list};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = AppConfig::resolve_path(cli.config.as_deref());
    let config = AppConfig::load(&config_path)?;
    let database_path = cli
        .database
        .clone()
        .unwrap_or_else(|| config.database_location());

    let storage = Arc::new(SqliteStorage::open(&database_path).await?);

    match cli.command {
        Commands::Send(args) => send(args, &config, &config_path, &storage).await,
        Commands::History { search } => print_history(&storage, search.as_deref()).await,
        Commands::Show { campaign_id } => show_campaign(&storage, &campaign_id).await,
        Commands::Stats => print_stats(&storage).await,
        Commands::Compare {
            recipients,
            column,
            campaign,
            list,
        } => compare_recipients(&storage, &recipients, column, campaign.as_deref(), list).await,
        Commands::Drafts { command } => drafts(&storage, command).await,
        Commands::MarkRetried { ids } => {
            let marked = history::mark_retried(&storage, &ids).await?;
            println!("Marked {} of {} failed records as retried", marked, ids.len());
            Ok(())
        }
        Commands::Migrate {
            consolidate,
            dry_run,
            yes,
        } => migrate(&storage, consolidate, dry_run, yes).await,
        Commands::Check => check(&config, &config_path, &database_path, &storage).await,
    }
}

// ============================================================================
// send
// ============================================================================

async fn send(
    args: SendArgs,
    config: &AppConfig,
    config_path: &Path,
    storage: &Arc<SqliteStorage>,
) -> Result<()> {
    // Flags and draft values apply to this run only.
    let mut config = config.clone();
    if let Some(batch_size) = args.batch_size {
        config.batch.batch_size = batch_size;
    }
    if let Some(delay) = args.delay {
        config.batch.delay_seconds = delay;
    }
    if args.no_bcc {
        config.batch.use_bcc = false;
    }

    let draft = match args.draft {
        Some(id) => Some(
            storage
                .get_draft(id)
                .await?
                .with_context(|| format!("Draft {} not found", id))?,
        ),
        None => None,
    };

    let mut profile = SenderProfile::from_config(&config.aws, &config.sender);
    if let Some(draft) = draft.as_ref().filter(|d| !d.sender.trim().is_empty()) {
        profile.source_address = draft.sender.clone();
        config.aws.source_email = draft.sender.clone();
    }
    config.validate_for_sending()?;

    // Recipients: test list, or CSV column plus --to plus the draft's list.
    let mut recipients: Vec<String> = Vec::new();
    if args.test {
        recipients.extend(config.test_recipients.iter().cloned());
    } else {
        if let Some(path) = &args.recipients {
            let column = args.column.unwrap_or(config.last_excel_column);
            recipients.extend(read_column(path, column)?);
            if let Err(e) = AppConfig::remember_recipient_file(config_path, path, column) {
                warn!(error = %format!("{:#}", e), "Could not remember the recipient file");
            }
        }
        recipients.extend(args.extra_recipients.iter().cloned());
        if let Some(draft) = &draft {
            recipients.extend(draft.recipients.iter().cloned());
        }
    }

    let recipients = dedupe(recipients);
    let (mut recipients, invalid) = partition_valid(&recipients);
    for address in &invalid {
        warn!(address = %address, "Skipping invalid address");
    }

    if args.skip_sent {
        let comparison = compare(storage, &recipients, &CompareScope::AllHistory).await?;
        println!(
            "Skipping {} already-sent addresses, {} remain",
            comparison.already_sent.len(),
            comparison.new_recipients.len()
        );
        let fresh: HashSet<String> = comparison.new_recipients.into_iter().collect();
        recipients.retain(|r| fresh.contains(&r.trim().to_lowercase()));
    }

    let composition = compose(&args, draft.as_ref(), &config)?;
    let request = SendRequest {
        recipients,
        composition,
        settings: BatchSettings::from_config(&config.batch)?,
    };

    let provider = Arc::new(SesProvider::from_config(&config.aws).await);
    let mut session = SendSession::new(
        storage.clone(),
        provider,
        profile,
        RetryPolicy::from_config(&config.batch),
    );

    let signal_control = session.control();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if signal_control.pause().is_ok() {
                eprintln!("\nPausing after the current batch...");
            } else {
                eprintln!("\nInterrupted");
                std::process::exit(130);
            }
        }
    });

    let state = session.start(request, &TracingSink).await?;
    drive(&mut session, state).await?;
    print_summary(&session);

    if args.retry_failed && !session.progress().failed_list.is_empty() {
        let failed = session.progress().failed_list.clone();
        println!("Retrying {} failed recipients", failed.len());
        let state = session.retry(&failed, &TracingSink).await?;
        drive(&mut session, state).await?;
        print_summary(&session);
    }

    if let Some(path) = &args.export_failed {
        let failed = &session.progress().failed_list;
        if failed.is_empty() {
            println!("No failed recipients to export");
        } else {
            export_failed(path, failed)?;
            println!("Exported {} failed recipients to {}", failed.len(), path.display());
        }
    }
    Ok(())
}

fn compose(
    args: &SendArgs,
    draft: Option<&sesmail::drafts::Draft>,
    config: &AppConfig,
) -> Result<Composition> {
    let subject = args
        .subject
        .clone()
        .or_else(|| draft.map(|d| d.subject.clone()))
        .filter(|s| !s.trim().is_empty())
        .context("A subject is required (--subject or --draft)")?;

    let body = match (&args.body, &args.body_file) {
        (Some(body), _) => body.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read body from {}", path.display()))?,
        (None, None) => draft
            .map(|d| d.body.clone())
            .context("A body is required (--body, --body-file or --draft)")?,
    };

    let email_type = if args.plain {
        EmailType::Plain
    } else {
        draft.map(|d| d.email_type).unwrap_or_default()
    };

    let mut attachments: Vec<PathBuf> = args.attachments.clone();
    if let Some(draft) = draft {
        attachments.extend(draft.attachments.iter().map(PathBuf::from));
    }
    let attachments = attachments
        .into_iter()
        .map(|path| resolve_attachment(path, &config.files_directory))
        .collect();

    Ok(Composition {
        subject,
        body,
        email_type,
        attachments,
    })
}

fn resolve_attachment(path: PathBuf, files_directory: &Path) -> PathBuf {
    if path.exists() || path.is_absolute() {
        return path;
    }
    let in_files = files_directory.join(&path);
    if in_files.exists() { in_files } else { path }
}

/// Keep prompting while the run is paused.
async fn drive(
    session: &mut SendSession<SqliteStorage, SesProvider>,
    mut state: SendState,
) -> Result<()> {
    while state == SendState::Paused {
        let progress = session.progress();
        let answer = prompt(&format!(
            "Paused before batch {} of {} ({} sent, {} failed). [r]esume or [c]ancel? ",
            progress.current_batch_index + 1,
            progress.total_batches,
            progress.total_sent,
            progress.total_failed
        ))
        .await?;
        match answer.as_str() {
            "r" | "resume" => state = session.resume(&TracingSink).await?,
            "c" | "cancel" => {
                session.control().cancel()?;
                state = session.state();
            }
            _ => println!("Please answer r or c"),
        }
    }
    Ok(())
}

fn print_summary(session: &SendSession<SqliteStorage, SesProvider>) {
    let progress = session.progress();
    println!();
    println!("Send {}", session.state());
    println!("  Sent:    {}", progress.total_sent);
    println!("  Failed:  {}", progress.total_failed);
    println!(
        "  Batches: {} of {}",
        progress.current_batch_index, progress.total_batches
    );
    for entry in progress.failed_list.iter().take(20) {
        println!("  - {}: {}", entry.recipient, entry.error);
    }
    if progress.failed_list.len() > 20 {
        println!("  ... and {} more", progress.failed_list.len() - 20);
    }
}

async fn prompt(question: &str) -> Result<String> {
    print!("{}", question);
    std::io::stdout().flush()?;
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read from stdin")?;
    Ok(line.trim().to_lowercase())
}

// ============================================================================
// history, show, stats, compare
// ============================================================================

async fn print_history(storage: &Arc<SqliteStorage>, search: Option<&str>) -> Result<()> {
    let campaigns = match search {
        Some(query) => history::search_campaigns(storage, query).await?,
        None => history::list_campaigns(storage).await?,
    };
    if campaigns.is_empty() {
        println!("No campaigns found");
        return Ok(());
    }
    for campaign in &campaigns {
        let last_sent = campaign
            .last_sent
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{}  {:<40}  sent {:>6}  failed {:>5}  last {}{}",
            campaign.id,
            campaign.subject,
            campaign.sent_count,
            campaign.failed_count,
            last_sent,
            if campaign.template_count > 1 {
                format!("  ({} copies)", campaign.template_count)
            } else {
                String::new()
            }
        );
    }
    Ok(())
}

async fn show_campaign(storage: &Arc<SqliteStorage>, campaign_id: &str) -> Result<()> {
    let detail = history::campaign_detail(storage, campaign_id)
        .await?
        .with_context(|| format!("No campaign with id {}", campaign_id))?;
    let campaign = &detail.campaign;
    println!("Subject: {}", campaign.subject);
    println!("Sender:  {}", campaign.sender);
    println!("Templates: {}", campaign.template_ids.join(", "));
    println!("Sent to {} recipients, {} failures", campaign.sent_count, campaign.failed_count);
    println!();
    println!("Sent:");
    for record in &detail.sent_records {
        let sent_at = record.sent_at.map(|d| d.to_rfc3339()).unwrap_or_default();
        println!("  {}  {}  {}", sent_at, record.send_mode, record.recipient);
    }
    println!("Failed:");
    for record in &detail.failed_records {
        let failed_at = record.failed_at.map(|d| d.to_rfc3339()).unwrap_or_default();
        println!(
            "  [{}] {}  {}  {}{}",
            record.id,
            failed_at,
            record.recipient,
            record.error_reason,
            if record.retried { "  (retried)" } else { "" }
        );
    }
    Ok(())
}

async fn print_stats(storage: &Arc<SqliteStorage>) -> Result<()> {
    let stats = history::overall_stats(storage, Utc::now().date_naive()).await?;
    println!("Campaigns:         {}", stats.total_campaigns);
    println!("Emails sent:       {}", stats.total_sent);
    println!("Emails failed:     {}", stats.total_failed);
    println!("Unique recipients: {}", stats.unique_recipients);
    println!("Success rate:      {:.1}%", stats.success_rate);
    println!("Sent today:        {}", stats.sent_today);
    println!("Sent this week:    {}", stats.sent_this_week);

    let rows = history::database_stats(storage).await?;
    println!();
    println!("Database:");
    println!("  Templates:         {}", rows.templates);
    println!("  Unique campaigns:  {}", rows.unique_campaigns);
    println!("  Sent records:      {}", rows.sent_records);
    println!("  Unique recipients: {}", rows.distinct_recipients);
    println!("  Failed records:    {}", rows.failed_records);
    println!("  Drafts:            {}", rows.drafts);
    if rows.templates > rows.unique_campaigns {
        println!();
        println!(
            "{} duplicate templates can be merged with `sesmail migrate --consolidate`",
            rows.templates - rows.unique_campaigns
        );
    }
    Ok(())
}

async fn compare_recipients(
    storage: &Arc<SqliteStorage>,
    path: &Path,
    column: usize,
    campaign_id: Option<&str>,
    list: bool,
) -> Result<()> {
    let candidates = read_column(path, column)?;
    let scope = match campaign_id {
        Some(id) => {
            let campaign = history::list_campaigns(storage)
                .await?
                .into_iter()
                .find(|c| c.id == id)
                .with_context(|| format!("No campaign with id {}", id))?;
            CompareScope::campaign(&campaign)
        }
        None => CompareScope::AllHistory,
    };
    let comparison = compare(storage, &candidates, &scope).await?;

    println!("Total:        {}", comparison.total);
    println!("Already sent: {}", comparison.already_sent.len());
    println!("New:          {}", comparison.new_recipients.len());
    if list {
        println!();
        println!("Already sent:");
        for address in &comparison.already_sent {
            println!("  {}", address);
        }
        println!("New:");
        for address in &comparison.new_recipients {
            println!("  {}", address);
        }
    }
    Ok(())
}

// ============================================================================
// drafts
// ============================================================================

async fn drafts(storage: &Arc<SqliteStorage>, command: DraftCommands) -> Result<()> {
    match command {
        DraftCommands::List => {
            let drafts = storage.list_drafts().await?;
            if drafts.is_empty() {
                println!("No drafts");
            }
            for draft in drafts {
                let updated = draft
                    .updated_at
                    .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!("{:>4}  {:<24}  {:<40}  {}", draft.id, draft.name, draft.subject, updated);
            }
        }
        DraftCommands::Show { id } => {
            let draft = storage
                .get_draft(id)
                .await?
                .with_context(|| format!("Draft {} not found", id))?;
            println!("{}", serde_json::to_string_pretty(&draft)?);
        }
        DraftCommands::Create {
            name,
            subject,
            body_file,
            sender,
            recipients,
            attachments,
            plain,
        } => {
            let body = match body_file {
                Some(path) => fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read body from {}", path.display()))?,
                None => String::new(),
            };
            let id = storage
                .insert_draft(&NewDraft {
                    name,
                    subject,
                    body,
                    sender,
                    recipients: split_list(&recipients),
                    attachments,
                    email_type: if plain { EmailType::Plain } else { EmailType::Html },
                })
                .await?;
            println!("Created draft {}", id);
        }
        DraftCommands::Update { id, fields } => {
            let mut patch = DraftPatch::new();
            for assignment in &fields {
                let (field, value) = assignment
                    .split_once('=')
                    .with_context(|| format!("Expected FIELD=VALUE, got '{}'", assignment))?;
                patch = patch.set(DraftField::from_str(field.trim())?, value)?;
            }
            if storage.update_draft(id, &patch).await? {
                println!("Updated draft {}", id);
            } else {
                anyhow::bail!("Draft {} not found", id);
            }
        }
        DraftCommands::Delete { id } => {
            if storage.delete_draft(id).await? {
                println!("Deleted draft {}", id);
            } else {
                anyhow::bail!("Draft {} not found", id);
            }
        }
    }
    Ok(())
}

// ============================================================================
// migrate, check
// ============================================================================

async fn migrate(
    storage: &Arc<SqliteStorage>,
    consolidate: bool,
    dry_run: bool,
    yes: bool,
) -> Result<()> {
    if !consolidate {
        println!("Nothing to do. Available migrations:");
        println!("  --consolidate   merge duplicate templates into their oldest copy");
        return Ok(());
    }

    println!("Migration: consolidating duplicate templates");
    println!();
    let groups = history::find_duplicate_groups(storage).await?;
    if groups.is_empty() {
        println!("No duplicate templates found");
        return Ok(());
    }

    let removable: usize = groups.iter().map(|g| g.duplicate_ids.len()).sum();
    for group in &groups {
        println!(
            "  {} ({}): keep {}, merge {}",
            group.subject,
            group.sender,
            group.canonical_id,
            group.duplicate_ids.len()
        );
    }
    println!();
    println!("{} groups, {} templates to remove", groups.len(), removable);

    if dry_run {
        println!("Dry run, no changes made");
        return Ok(());
    }
    if !yes {
        let answer = prompt("Proceed? [y/N] ").await?;
        if answer != "y" && answer != "yes" {
            println!("Aborted");
            return Ok(());
        }
    }

    let report = history::consolidate_duplicates(storage).await?;
    info!(groups = report.groups_processed, "Consolidation finished");
    println!();
    println!("Migration complete!");
    println!("  Groups merged:          {}", report.groups_processed);
    println!("  Templates removed:      {}", report.templates_removed);
    println!("  Sent records moved:     {}", report.sent_records_rewritten);
    println!("  Failed records moved:   {}", report.failed_records_rewritten);
    Ok(())
}

async fn check(
    config: &AppConfig,
    config_path: &Path,
    database_path: &Path,
    storage: &Arc<SqliteStorage>,
) -> Result<()> {
    println!("Settings:  {}", config_path.display());
    println!(
        "AWS:       {}",
        if config.is_configured() {
            "configured"
        } else {
            "missing credentials, region or source email"
        }
    );
    let profile = SenderProfile::from_config(&config.aws, &config.sender);
    match profile.formatted_from() {
        Ok(from) => println!("From:      {}", from),
        Err(e) => println!("From:      invalid ({:#})", e),
    }
    match config.validate_for_sending() {
        Ok(()) => println!("Sending:   ready"),
        Err(e) => println!("Sending:   not ready ({:#})", e),
    }

    println!("Database:  {}", database_path.display());
    let counts = storage.table_counts().await?;
    println!(
        "           {} templates, {} sent, {} failed, {} drafts",
        counts.templates, counts.sent_records, counts.failed_records, counts.drafts
    );
    Ok(())
}
