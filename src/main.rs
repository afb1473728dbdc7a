use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use branch_fixer::apply::FsChangeApplier;
use branch_fixer::config::{self, Config, FixSettings, SettingsOverrides};
use branch_fixer::coordinator::{CancellationFlag, FixAttemptCoordinator};
use branch_fixer::discovery::Discovery;
use branch_fixer::git_ops::{self, GitIsolation};
use branch_fixer::llm::{LlmFixGenerator, OpenRouterClient};
use branch_fixer::model::ErrorRecord;
use branch_fixer::pytest::PytestCommand;
use branch_fixer::session::{Disposition, FixSession, SessionRunner, SessionSummary};
use branch_fixer::store::SessionStore;
use branch_fixer::verify::PytestVerifier;
use branch_fixer::workspace;

#[derive(Parser, Debug)]
#[command(
    name = "branch-fixer",
    about = "Finds failing pytest tests and repairs them with model-proposed edits",
    version
)]
struct Args {
    /// Path to the repository (defaults to current directory)
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Only run tests under this path (relative to the repository)
    #[arg(long)]
    test_path: Option<PathBuf>,

    /// Only run this test function (requires --test-path)
    #[arg(long, requires = "test_path")]
    test_function: Option<String>,

    /// Attempts per failing test
    #[arg(long)]
    max_retries: Option<u32>,

    /// Sampling temperature of the first attempt
    #[arg(long)]
    initial_temp: Option<f64>,

    /// Temperature added per further attempt
    #[arg(long)]
    temp_increment: Option<f64>,

    /// Files worked on at once (ignored with git branches)
    #[arg(long)]
    lanes: Option<usize>,

    /// Fix every failure without asking
    #[arg(long)]
    non_interactive: bool,

    /// Edit the working tree directly instead of a branch per fix
    #[arg(long)]
    no_git: bool,

    /// Open a pull request for each fixed test (needs gh)
    #[arg(long)]
    create_pr: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Store an API key in the system keychain and exit
    #[arg(long)]
    setup: bool,

    /// List stored sessions and exit
    #[arg(long)]
    sessions: bool,

    /// Fix only the first failing test, then stop
    #[arg(long)]
    fast_run: bool,

    /// Delete local fix/* branches that are not checked out, then exit
    #[arg(long)]
    cleanup_only: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(args.verbose);

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "branch_fixer=debug"
    } else {
        "branch_fixer=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .without_time()
                .compact(),
        )
        .with(filter)
        .init();
}

/// Returns whether every discovered failure ended fixed.
async fn run(args: Args) -> Result<bool> {
    if args.setup {
        config::setup_api_key_interactive().map_err(|e| anyhow::anyhow!(e))?;
        return Ok(true);
    }

    let root = args
        .path
        .canonicalize()
        .with_context(|| format!("workspace {} does not exist", args.path.display()))?;

    if args.sessions {
        list_sessions(&SessionStore::new(&root))?;
        return Ok(true);
    }

    if args.cleanup_only {
        let deleted = git_ops::cleanup_fix_branches(&root)
            .with_context(|| format!("could not clean up fix branches in {}", root.display()))?;
        if deleted.is_empty() {
            println!("No fix branches to delete.");
        }
        for branch in &deleted {
            println!("Deleted {}", branch);
        }
        return Ok(true);
    }

    let overrides = SettingsOverrides {
        max_attempts: args.max_retries,
        initial_temperature: args.initial_temp,
        temperature_increment: args.temp_increment,
        lanes: args.lanes,
    };
    let settings = FixSettings::load(&root)?.with_overrides(&overrides);
    let policy = settings.validate()?;

    let pytest = PytestCommand::new(&root)
        .with_program(settings.pytest_program.clone())
        .with_extra_args(settings.pytest_args.clone());
    let info = workspace::validate(&root, &pytest)?;

    let client = OpenRouterClient::from_config(&Config::load())?;
    info!(model = client.model(), "using model");

    let discovery = Discovery::new(pytest.clone());
    let report = discovery
        .discover(
            args.test_path.as_deref(),
            args.test_function.as_deref(),
            settings.discovery_timeout(),
        )
        .await?;

    if report.failures.is_empty() {
        if report.passed {
            println!("All tests pass; nothing to fix.");
        } else {
            println!("pytest reported failures that could not be parsed:\n{}", report.output_tail);
            return Ok(false);
        }
        return Ok(true);
    }

    let mut session = FixSession::new(report.into_records());
    if let Some(scope) = &args.test_path {
        session = session.with_scope(scope.display().to_string());
    }
    println!("Found {} failing test(s):", session.records.len());
    for record in &session.records {
        println!(
            "  {}  {}: {}",
            record.node_id(),
            record.details.error_type,
            record.details.message
        );
    }
    if args.fast_run {
        info!("fast run: only the first failing test is attempted");
        session = session.with_limit(1);
    }

    let selected = if args.non_interactive {
        session.records.iter().map(|r| r.id).collect::<Vec<_>>()
    } else {
        choose_records(&session.records)?
    };

    let cancel = CancellationFlag::new();
    let coordinator = FixAttemptCoordinator::new(
        LlmFixGenerator::new(client, &root),
        FsChangeApplier::new(&root),
        PytestVerifier::new(pytest),
        policy,
    )
    .with_timeouts(settings.step_timeouts())
    .with_cancellation(cancel.clone());

    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancelling after the current attempt (Ctrl-C again to interrupt it)");
            cancel.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupting the current attempt; rolling back its change first");
                cancel.abort();
            }
        }
    });

    let isolation = if args.no_git || !info.is_git {
        None
    } else {
        let isolation = GitIsolation::new(&root)?;
        session.branch = Some(isolation.base_branch().to_string());
        Some(isolation)
    };

    let mut runner = SessionRunner::new(&coordinator).with_lanes(settings.lanes);
    if let Some(isolation) = &isolation {
        runner = runner.with_isolation(isolation);
    }
    let summary = runner
        .run_selected(&mut session, |record| selected.contains(&record.id))
        .await;
    ctrl_c.abort();

    let store = SessionStore::new(&root);
    match store.save(&session) {
        Ok(path) => info!(path = %path.display(), "session saved"),
        Err(e) => warn!("could not save session: {}", e),
    }

    print_summary(&summary);

    if let Some(isolation) = &isolation {
        offer_pull_requests(&root, isolation, &session, args.create_pr, args.non_interactive)?;
    }

    Ok(summary.all_fixed())
}

fn choose_records(records: &[ErrorRecord]) -> Result<Vec<uuid::Uuid>> {
    let mut chosen = Vec::new();
    for record in records {
        if confirm(&format!("Fix {}?", record.node_id()), true)? {
            chosen.push(record.id);
        }
    }
    Ok(chosen)
}

fn confirm(question: &str, default_yes: bool) -> Result<bool> {
    let hint = if default_yes { "[Y/n]" } else { "[y/N]" };
    print!("{} {} ", question, hint);
    io::stdout().flush()?;

    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(default_yes);
    }
    Ok(match line.trim().to_lowercase().as_str() {
        "" => default_yes,
        "y" | "yes" => true,
        _ => false,
    })
}

fn print_summary(summary: &SessionSummary) {
    println!();
    for outcome in &summary.outcomes {
        let label = match outcome.disposition {
            Disposition::Fixed => "fixed",
            Disposition::Abandoned => "abandoned",
            Disposition::Inconsistent => "INCONSISTENT",
            Disposition::Skipped => "skipped",
        };
        let name = branch_fixer::model::node_id(&outcome.file_path, &outcome.test_function);
        print!("  {:<12} {} ({} attempt(s))", label, name, outcome.attempts);
        if let Some(note) = &outcome.note {
            print!(": {}", note);
        }
        println!();
    }
    println!(
        "\n{} fixed, {} abandoned, {} inconsistent, {} skipped",
        summary.fixed, summary.abandoned, summary.inconsistent, summary.skipped
    );
    if summary.inconsistent > 0 {
        println!("Files marked INCONSISTENT could not be restored; check them by hand.");
    }
}

fn offer_pull_requests(
    root: &std::path::Path,
    isolation: &GitIsolation,
    session: &FixSession,
    create_pr: bool,
    non_interactive: bool,
) -> Result<()> {
    let fixed = isolation.fixed_branches();
    if fixed.is_empty() {
        return Ok(());
    }
    if !create_pr && non_interactive {
        println!("\nFix branches:");
        for branch in &fixed {
            println!("  {}  {}", branch.branch, branch.title);
        }
        return Ok(());
    }

    for branch in fixed {
        let wanted = create_pr || confirm(&format!("Open a PR for {}?", branch.branch), false)?;
        if !wanted {
            continue;
        }
        let body = session
            .records
            .iter()
            .find(|r| r.id == branch.record_id)
            .map(pr_body)
            .unwrap_or_default();
        match git_ops::create_pr(root, &branch.branch, isolation.base_branch(), &branch.title, &body) {
            Ok(url) => println!("  PR: {}", url),
            Err(e) => warn!(branch = %branch.branch, "could not open PR: {:#}", e),
        }
    }
    Ok(())
}

fn pr_body(record: &ErrorRecord) -> String {
    let description = record
        .last_attempt()
        .and_then(|a| a.change.as_ref())
        .map(|c| c.description.as_str())
        .unwrap_or("");
    format!(
        "Fixes failing test `{}`.\n\nError: {}: {}\n\n{}\n\nAttempts: {}",
        record.node_id(),
        record.details.error_type,
        record.details.message,
        description,
        record.attempts().len()
    )
}

fn list_sessions(store: &SessionStore) -> Result<()> {
    let sessions = store.list(None)?;
    if sessions.is_empty() {
        println!("No stored sessions in {}", store.dir().display());
        return Ok(());
    }
    for session in sessions {
        println!(
            "{}  {:<9}  {}  {}/{} fixed{}",
            session.id,
            format!("{:?}", session.state).to_lowercase(),
            session.started_at.format("%Y-%m-%d %H:%M"),
            session.count(branch_fixer::model::ErrorStatus::Fixed),
            session.records.len(),
            session
                .scope
                .as_deref()
                .map(|s| format!("  [{}]", s))
                .unwrap_or_default()
        );
    }
    Ok(())
}
