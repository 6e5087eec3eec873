mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    audit::AuditSubcommand, config::ConfigSubcommand, key::KeySubcommand,
    ledger::LedgerSubcommand, overrides::OverrideSubcommand, ProductArgs,
};
use quotemail_core::QuoteError;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "quotemail",
    about = "Bulk quote-request mailer with send ledger, PII screening and encrypted audit logs",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .quotemail/)
    #[arg(long, global = true, env = "QUOTEMAIL_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .quotemail/ with a default config and an encryption key
    Init {
        /// Do not generate an encryption key
        #[arg(long)]
        no_key: bool,
    },

    /// Manage the email encryption key
    Key {
        #[command(subcommand)]
        subcommand: KeySubcommand,
    },

    /// Load and validate a contact CSV
    Load {
        /// Contact CSV file
        file: PathBuf,
        /// Force an input encoding (utf-8, shift_jis, cp932, ...)
        #[arg(long)]
        encoding: Option<String>,
    },

    /// Render the mail for one contact without sending
    Render {
        /// Contact CSV file
        file: PathBuf,
        /// Body template (.txt or .docx); built-in default when omitted
        #[arg(long)]
        template: Option<PathBuf>,
        /// Subject template text
        #[arg(long)]
        subject: Option<String>,
        /// 1-based data row to render
        #[arg(long, default_value = "1")]
        row: usize,
        #[command(flatten)]
        product: ProductArgs,
    },

    /// Validate a URL (scheme, internal-address and redirect checks)
    CheckUrl { url: String },

    /// Screen a search query for personal data
    Screen {
        query: String,
        /// Also warn about company names from this contact CSV
        #[arg(long)]
        contacts: Option<PathBuf>,
    },

    /// Send quote requests to every contact in a CSV
    Send {
        /// Contact CSV file
        file: PathBuf,
        /// Body template (.txt or .docx); built-in default when omitted
        #[arg(long)]
        template: Option<PathBuf>,
        /// Subject template text
        #[arg(long)]
        subject: Option<String>,
        #[command(flatten)]
        product: ProductArgs,
        /// Search query to screen before sending
        #[arg(long)]
        query: Option<String>,
        /// Force an input encoding
        #[arg(long)]
        encoding: Option<String>,
        /// Render and check everything, send nothing
        #[arg(long)]
        dry_run: bool,
        /// Answer yes to batch and re-send confirmations
        #[arg(long, short = 'y')]
        yes: bool,
        /// Send one test mail, rendered for the first row, to this address only
        #[arg(long, value_name = "ADDR")]
        test_to: Option<String>,
    },

    /// Time-limited rerun overrides
    Override {
        #[command(subcommand)]
        subcommand: OverrideSubcommand,
    },

    /// Inspect and maintain the send ledger
    Ledger {
        #[command(subcommand)]
        subcommand: LedgerSubcommand,
    },

    /// Inspect audit records
    Audit {
        #[command(subcommand)]
        subcommand: AuditSubcommand,
    },

    /// Inspect and validate the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Send { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { no_key } => cmd::init::run(&root, no_key),
        Commands::Key { subcommand } => cmd::key::run(&root, subcommand, cli.json),
        Commands::Load { file, encoding } => {
            cmd::load::run(&root, &file, encoding.as_deref(), cli.json)
        }
        Commands::Render {
            file,
            template,
            subject,
            row,
            product,
        } => cmd::render::run(
            &root,
            &file,
            template.as_deref(),
            subject.as_deref(),
            row,
            product,
            cli.json,
        ),
        Commands::CheckUrl { url } => cmd::check_url::run(&root, &url, cli.json),
        Commands::Screen { query, contacts } => {
            cmd::screen::run(&root, &query, contacts.as_deref(), cli.json)
        }
        Commands::Send {
            file,
            template,
            subject,
            product,
            query,
            encoding,
            dry_run,
            yes,
            test_to,
        } => cmd::send::run(
            &root,
            cmd::send::SendArgs {
                file,
                template,
                subject,
                product,
                query,
                encoding,
                dry_run,
                yes,
                test_to,
            },
            cli.json,
        ),
        Commands::Override { subcommand } => cmd::overrides::run(&root, subcommand, cli.json),
        Commands::Ledger { subcommand } => cmd::ledger::run(&root, subcommand, cli.json),
        Commands::Audit { subcommand } => cmd::audit::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(exit_code(&e));
    }
}

/// 3: confirmation required or refused. 4: the input or a policy rejected
/// the run before anything was sent. 1: everything else.
fn exit_code(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<QuoteError>() {
        Some(QuoteError::Cancelled(_)) => 3,
        Some(
            QuoteError::RecipientLimit { .. }
            | QuoteError::Schema(_)
            | QuoteError::EmptyInput(_)
            | QuoteError::FileNotFound(_)
            | QuoteError::InvalidInput(_)
            | QuoteError::MissingVariables(_)
            | QuoteError::UnsupportedTemplate(_)
            | QuoteError::PolicyViolation(_),
        ) => 4,
        _ => 1,
    }
}
