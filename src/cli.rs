use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::commands::{self, CommandReport};
use crate::vault::model::LinkPreview;

#[derive(Parser)]
#[command(name = "chat-vault")]
#[command(version, about = "Capture chat history into per-source SQLite archives", long_about = None)]
struct Cli {
    /// Print the command report as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one incremental capture cycle for a source
    Capture { source: String },
    /// Re-export the full history to refresh reactions and attachments
    Resync { source: String },
    /// Control the background capture workers
    Workers {
        #[command(subcommand)]
        action: WorkersCommand,
    },
    /// Remove entries whose share links are all stale
    Cleanup {
        #[command(subcommand)]
        action: CleanupCommand,
    },
    /// Manage configured sources
    Sources {
        #[command(subcommand)]
        action: SourcesCommand,
    },
    /// Page through archived entries in time order
    Messages {
        source: String,
        /// Negative values count back from the newest entry
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        offset: i64,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one archived entry
    Message { source: String, id: i64 },
    /// Keyword search; prefix a term with `-` to exclude it
    Search {
        source: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        query: Vec<String>,
    },
    /// Reaction totals for a source
    Reactions { source: String },
    /// Entries carrying a reaction, most reacted first
    ByReaction {
        source: String,
        emoticon: String,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Store a link preview for an entry
    Preview(PreviewArgs),
    /// Summarize the vault, workers and sources
    Status,
}

#[derive(Subcommand)]
enum WorkersCommand {
    /// Enable workers and keep them running in the foreground
    Run,
    Status,
    Stop,
}

#[derive(Subcommand)]
enum CleanupCommand {
    Run {
        source: String,
        /// Comma-separated providers: ali, baidu, quark, xunlei
        #[arg(long)]
        providers: String,
    },
    Status {
        source: String,
    },
    Stop {
        source: String,
    },
}

#[derive(Subcommand)]
enum SourcesCommand {
    Add {
        /// Chat id, or a username with --lookup
        source: String,
        #[arg(long)]
        remark: Option<String>,
        #[arg(long)]
        no_download: bool,
        #[arg(long)]
        images_only: bool,
        #[arg(long)]
        recent_only: bool,
        /// Export formatted text instead of raw records
        #[arg(long)]
        plain: bool,
        /// Resolve the chat through tdl before saving
        #[arg(long)]
        lookup: bool,
    },
    List,
    Remove {
        source: String,
    },
}

#[derive(Args)]
struct PreviewArgs {
    source: String,
    id: i64,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    image: Option<String>,
    #[arg(long)]
    site_name: Option<String>,
    #[arg(long)]
    url: Option<String>,
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!(
        "{}: {}",
        report.command,
        if report.ok { "ok" } else { "failed" }
    );
    for detail in &report.details {
        println!("  {detail}");
    }
    for issue in &report.issues {
        println!("issue: {issue}");
    }
    Ok(())
}

fn dispatch(command: Command) -> Result<CommandReport> {
    match command {
        Command::Capture { source } => commands::capture::run(&source),
        Command::Resync { source } => commands::resync::run(&source),
        Command::Workers { action } => match action {
            WorkersCommand::Run => commands::workers::run(),
            WorkersCommand::Status => commands::workers::status(),
            WorkersCommand::Stop => commands::workers::stop(),
        },
        Command::Cleanup { action } => match action {
            CleanupCommand::Run { source, providers } => {
                commands::cleanup::run(&source, &providers)
            }
            CleanupCommand::Status { source } => commands::cleanup::status(&source),
            CleanupCommand::Stop { source } => commands::cleanup::stop(&source),
        },
        Command::Sources { action } => match action {
            SourcesCommand::Add {
                source,
                remark,
                no_download,
                images_only,
                recent_only,
                plain,
                lookup,
            } => commands::sources::add(
                &source,
                &commands::sources::AddOptions {
                    remark,
                    no_download,
                    images_only,
                    recent_only,
                    plain,
                    lookup,
                },
            ),
            SourcesCommand::List => commands::sources::list(),
            SourcesCommand::Remove { source } => commands::sources::remove(&source),
        },
        Command::Messages {
            source,
            offset,
            limit,
        } => commands::browse::messages(&source, offset, limit),
        Command::Message { source, id } => commands::browse::message(&source, id),
        Command::Search { source, query } => commands::browse::search(&source, &query.join(" ")),
        Command::Reactions { source } => commands::browse::reactions(&source),
        Command::ByReaction {
            source,
            emoticon,
            offset,
            limit,
        } => commands::browse::by_reaction(&source, &emoticon, offset, limit),
        Command::Preview(args) => commands::browse::set_preview(
            &args.source,
            args.id,
            &LinkPreview {
                title: args.title,
                image: args.image,
                description: args.description,
                site_name: args.site_name,
                url: args.url,
            },
        ),
        Command::Status => commands::status::run(),
    }
}

pub fn run() -> Result<()> {
    crate::logging::init();
    let cli = Cli::parse();
    let report = dispatch(cli.command)?;
    print_report(&report, cli.json)?;
    if !report.ok {
        std::process::exit(2);
    }
    Ok(())
}
