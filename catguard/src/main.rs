//! Guardrail and orchestration CLI for coding agents sharing one repository.
//!
//! Every command prints one JSON document on stdout; diagnostics go to stderr.
//! Exit codes are listed in [`catguard::exit_codes`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use catguard::exit_codes;
use catguard::guard::{self, Decision, GuardContext};
use catguard::io::config::{CatConfig, load_config};
use catguard::io::git::Git;
use catguard::io::lock_store;
use catguard::io::paths::ProjectPaths;
use catguard::ops::OpOutcome;
use catguard::ops::amend::{FetchRemote, SharedRefs, amend_safe};
use catguard::ops::merge::{MergeRequest, merge_and_cleanup};
use catguard::ops::rebase::rebase_safe;
use catguard::prepare::{PrepareRequest, prepare};
use catguard::select::{SelectRequest, select_from_root};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "catguard",
    version,
    about = "Guardrails and git safety wrappers for multi-agent worktrees"
)]
struct Cli {
    /// Project root containing `.claude/cat` (defaults to the current directory).
    #[arg(long, global = true, env = "CLAUDE_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Caller {
    /// Session id of the calling agent.
    #[arg(long, env = "CLAUDE_SESSION_ID", default_value = "")]
    session_id: String,
    /// Subagent identity (`<session>/subagents/<name>`).
    #[arg(long, env = "CAT_AGENT_ID", default_value = "")]
    agent_id: String,
}

#[derive(Args)]
struct Selection {
    /// `all`, a major (`2`), a minor (`2.1`), an issue id (`2.1-name`), or a bare name.
    scope: Option<String>,
    /// Glob excluding issues by bare name or qualified id.
    #[arg(long)]
    exclude: Option<String>,
    /// Consider post-condition issues even while sibling issues are open.
    #[arg(long)]
    override_postconditions: bool,
}

impl Selection {
    fn into_request(self) -> SelectRequest {
        SelectRequest {
            scope: self.scope,
            exclude: self.exclude,
            override_postconditions: self.override_postconditions,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Vet a Bash command before it runs.
    CheckBash {
        #[arg(long)]
        command: String,
        /// Working directory the command will run in.
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[command(flatten)]
        caller: Caller,
    },
    /// Vet a file write by a Write/Edit/NotebookEdit tool.
    CheckWrite {
        #[arg(long)]
        file_path: String,
        #[arg(long, default_value = "Write")]
        tool: String,
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[command(flatten)]
        caller: Caller,
    },
    /// Print the next claimable issue for a scope.
    NextIssue {
        #[command(flatten)]
        selection: Selection,
    },
    /// Claim the next issue: lock it and create its worktree.
    Prepare {
        #[command(flatten)]
        selection: Selection,
        /// Base branch to fork from (defaults to the current branch).
        #[arg(long)]
        base: Option<String>,
        #[command(flatten)]
        caller: Caller,
    },
    /// Amend HEAD unless it is already pushed.
    Amend {
        #[arg(long, short)]
        message: Option<String>,
        /// Fetch the tracking branch before the post-amend check.
        #[arg(long)]
        fetch: bool,
        /// Worktree to operate in (defaults to the current directory).
        #[arg(long)]
        worktree: Option<PathBuf>,
    },
    /// Rebase with a backup branch onto `--target` or the recorded fork point.
    Rebase {
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        worktree: Option<PathBuf>,
    },
    /// Fast-forward an issue branch into its base, then remove its worktree and lock.
    MergeAndCleanup {
        issue_id: String,
        #[command(flatten)]
        caller: Caller,
    },
    /// Inspect or release issue locks.
    Lock {
        #[command(subcommand)]
        command: LockCommand,
    },
}

#[derive(Subcommand)]
enum LockCommand {
    /// List readable locks.
    List,
    /// Release a lock you own.
    Release {
        issue_id: String,
        #[command(flatten)]
        caller: Caller,
    },
    /// Delete a lock regardless of owner.
    ForceRelease { issue_id: String },
}

fn main() {
    catguard::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("read current directory")?,
    };
    match cli.command {
        Command::CheckBash {
            command,
            cwd,
            caller,
        } => {
            let cwd = cwd.unwrap_or_else(|| project_dir.clone());
            let decision = match guard_context(&project_dir, &caller) {
                Ok(ctx) => guard::check_bash(&command, &cwd, &ctx),
                Err(err) => unverifiable(&err),
            };
            emit_decision(&decision)
        }
        Command::CheckWrite {
            file_path,
            tool,
            cwd,
            caller,
        } => {
            let cwd = cwd.unwrap_or_else(|| project_dir.clone());
            let decision = match guard_context(&project_dir, &caller) {
                Ok(ctx) => guard::check_file_write(&tool, &file_path, &cwd, &ctx),
                Err(err) => unverifiable(&err),
            };
            emit_decision(&decision)
        }
        Command::NextIssue { selection } => {
            let resolution = select_from_root(&project_dir, &selection.into_request())?;
            print_json(&resolution)?;
            Ok(exit_codes::OK)
        }
        Command::Prepare {
            selection,
            base,
            caller,
        } => {
            let request = PrepareRequest {
                select: selection.into_request(),
                session_id: caller.session_id,
                agent_id: caller.agent_id,
                base,
                now: now(),
            };
            print_json(&prepare(&project_dir, &request)?)?;
            Ok(exit_codes::OK)
        }
        Command::Amend {
            message,
            fetch,
            worktree,
        } => {
            let config = load_project_config(&project_dir)?;
            let git = Git::new(worktree_dir(worktree)?);
            let result = if fetch {
                amend_safe(&git, &config.remote, message.as_deref(), &FetchRemote)
            } else {
                amend_safe(&git, &config.remote, message.as_deref(), &SharedRefs)
            };
            emit_outcome(&result)
        }
        Command::Rebase { target, worktree } => {
            let git = Git::new(worktree_dir(worktree)?);
            emit_outcome(&rebase_safe(&git, target.as_deref()))
        }
        Command::MergeAndCleanup { issue_id, caller } => {
            let config = load_project_config(&project_dir)?;
            let request = MergeRequest {
                issue_id: &issue_id,
                session_id: &caller.session_id,
                agent_id: &caller.agent_id,
                remote: &config.remote,
            };
            emit_outcome(&merge_and_cleanup(&project_dir, &request))
        }
        Command::Lock { command } => run_lock(&project_dir, command),
    }
}

fn run_lock(project_dir: &Path, command: LockCommand) -> Result<i32> {
    let paths = ProjectPaths::require(project_dir)?;
    match command {
        LockCommand::List => print_json(&lock_store::list_locks(&paths.locks_dir)?)?,
        LockCommand::Release { issue_id, caller } => {
            let released = lock_store::release(
                &paths.locks_dir,
                &issue_id,
                &caller.session_id,
                &caller.agent_id,
            )?;
            print_json(&json!({ "issue_id": issue_id, "released": released }))?;
        }
        LockCommand::ForceRelease { issue_id } => {
            let released = lock_store::force_release(&paths.locks_dir, &issue_id)?;
            print_json(&json!({ "issue_id": issue_id, "released": released }))?;
        }
    }
    Ok(exit_codes::OK)
}

fn guard_context(project_dir: &Path, caller: &Caller) -> Result<GuardContext> {
    let config = load_project_config(project_dir)?;
    GuardContext::load(project_dir, &caller.session_id, &config, now())
}

/// Guards fail closed when their configuration or lock snapshot is unreadable.
fn unverifiable(err: &anyhow::Error) -> Decision {
    warn!("guard context unavailable: {err:#}");
    Decision::block(format!(
        "UNSAFE: cannot load guardrail state, so this action cannot be verified: {err:#}\n\
         Fix .claude/cat/config.toml or the lock directory and retry."
    ))
}

fn load_project_config(project_dir: &Path) -> Result<CatConfig> {
    load_config(&ProjectPaths::new(project_dir).config_path)
}

fn worktree_dir(worktree: Option<PathBuf>) -> Result<PathBuf> {
    match worktree {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().context("read current directory"),
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn emit_decision(decision: &Decision) -> Result<i32> {
    print_json(decision)?;
    Ok(if decision.blocked {
        exit_codes::BLOCKED
    } else {
        exit_codes::OK
    })
}

fn emit_outcome<T: OpOutcome>(outcome: &T) -> Result<i32> {
    print_json(outcome)?;
    Ok(if outcome.status() == catguard::ops::OpStatus::Ok {
        exit_codes::OK
    } else {
        exit_codes::OP_FAILED
    })
}

/// Print `value` as pretty JSON on stdout.
fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
