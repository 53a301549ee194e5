//! `foreman`: drive a code-editing agent through a development plan, unattended.
//!
//! State lives under `.foreman/` in the workspace: `plan.json` holds the plan
//! with per-task history and `runs/<run-id>/` holds turn logs and the outcome.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use foreman::core::orchestrator::TaskOrchestrator;
use foreman::core::types::RequirementAnalysis;
use foreman::director::{Director, DirectorSettings, RunContext, TaskEvent};
use foreman::exit_codes;
use foreman::io::analysis::{CommandAnalyzer, RequirementAnalyzer, load_analysis};
use foreman::io::config::{CONFIG_FILE, ForemanConfig, load_catalog, load_config};
use foreman::io::evaluator::WorkspaceEvaluator;
use foreman::io::prompt::InstructionBuilder;
use foreman::io::run_log::{RunLogPaths, latest_run_id, new_run_id, write_outcome, write_turn};
use foreman::io::run_state::{RunState, load_run_state, plan_path, write_run_state};
use foreman::io::session::open_session;
use foreman::logging;
use foreman::plan::{Plan, TaskStatus};
use foreman::report::RunOutcome;

#[derive(Parser)]
#[command(
    name = "foreman",
    version,
    about = "Unattended director for a code-editing agent"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct WorkspaceArgs {
    /// Project directory the agent works in.
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Config file; defaults to `foreman.toml` in the workspace.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl WorkspaceArgs {
    fn load_config(&self) -> Result<ForemanConfig> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(|| self.workspace.join(CONFIG_FILE));
        load_config(&path)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decompose an analysis into a plan and print it.
    Plan {
        /// Requirement analysis JSON.
        #[arg(short, long)]
        analysis: PathBuf,

        #[command(flatten)]
        target: WorkspaceArgs,
    },
    /// Drive the agent through the plan until every task is done or a budget runs out.
    Run {
        /// Requirement analysis JSON.
        #[arg(short, long, conflicts_with_all = ["requirement", "resume"])]
        analysis: Option<PathBuf>,

        /// Free-text requirement, analyzed with the configured analyzer command.
        #[arg(short, long, conflicts_with = "resume")]
        requirement: Option<PathBuf>,

        /// Continue the plan saved in the state directory.
        #[arg(long)]
        resume: bool,

        #[command(flatten)]
        target: WorkspaceArgs,
    },
    /// Summarize the saved plan and the latest run.
    Status {
        #[command(flatten)]
        target: WorkspaceArgs,
    },
}

fn main() -> ExitCode {
    logging::init();
    match run() {
        Ok(code) => exit_code(code),
        Err(err) => {
            eprintln!("{err:#}");
            exit_code(exit_codes::INVALID)
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Plan { analysis, target } => cmd_plan(&analysis, &target),
        Command::Run {
            analysis,
            requirement,
            resume,
            target,
        } => cmd_run(analysis, requirement, resume, &target),
        Command::Status { target } => cmd_status(&target),
    }
}

fn cmd_plan(analysis: &Path, target: &WorkspaceArgs) -> Result<i32> {
    let cfg = target.load_config()?;
    let analysis = load_analysis(analysis)?;
    let plan = decompose(&cfg, &target.workspace, &analysis)?;
    for task in plan.in_order() {
        let deps = if task.depends_on.is_empty() {
            "-".to_string()
        } else {
            task.depends_on.join(",")
        };
        println!(
            "{}\tkind={}\tmandatory={}\tafter={}\tsubtasks={}",
            task.id,
            task.kind.as_str(),
            task.mandatory,
            deps,
            task.subtasks.len()
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_run(
    analysis: Option<PathBuf>,
    requirement: Option<PathBuf>,
    resume: bool,
    target: &WorkspaceArgs,
) -> Result<i32> {
    let cfg = target.load_config()?;
    let workspace = target.workspace.as_path();
    fs::create_dir_all(workspace)
        .with_context(|| format!("create workspace {}", workspace.display()))?;
    let state_dir = cfg.state_dir_in(workspace);
    let state_path = plan_path(&state_dir);

    let (run_id, analysis, mut plan) = if resume {
        let state = load_run_state(&state_path)?;
        let mut plan = state.plan;
        let reset = plan.reset_in_flight();
        info!(run_id = %state.run_id, reset = reset.len(), "resuming run");
        (state.run_id, state.analysis, plan)
    } else {
        let analysis = match (analysis, requirement) {
            (Some(path), _) => load_analysis(&path)?,
            (None, Some(path)) => {
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("read requirement {}", path.display()))?;
                CommandAnalyzer::new(cfg.analyzer.clone(), workspace.to_path_buf())
                    .analyze(&text)?
            }
            (None, None) => bail!("pass --analysis <file>, --requirement <file> or --resume"),
        };
        let plan = decompose(&cfg, workspace, &analysis)?;
        (new_run_id(Utc::now()), analysis, plan)
    };

    let persist = |plan: &Plan| -> Result<()> {
        write_run_state(
            &state_path,
            &RunState {
                run_id: run_id.clone(),
                updated_at: Utc::now(),
                analysis: analysis.clone(),
                plan: plan.clone(),
            },
        )
    };
    persist(&plan)?;

    let session = open_session(&cfg, workspace)?;
    let evaluator = WorkspaceEvaluator::from_config(&cfg)?;
    let instructions = InstructionBuilder::new();
    let logs = RunLogPaths::new(&state_dir, &run_id);
    let ctx = RunContext::new(
        run_id.clone(),
        &analysis,
        workspace.to_path_buf(),
        DirectorSettings::from_config(&cfg),
        plan.total_retries(),
    );

    let director = Director::new(session.as_ref(), &evaluator, &instructions);
    let outcome = director.run(&ctx, &mut plan, |plan, event| {
        if let TaskEvent::Turn { task, turn } = event
            && let Err(err) = write_turn(&logs, &run_id, task, turn)
        {
            warn!(task = %task, error = %format!("{err:#}"), "could not write turn log");
        }
        if let Err(err) = persist(plan) {
            warn!(error = %format!("{err:#}"), "could not persist plan");
        }
    });

    persist(&plan)?;
    let path = write_outcome(&logs, &outcome)?;
    info!(path = %path.display(), "outcome written");
    print!("{}", outcome.render());
    Ok(outcome.exit_code())
}

fn cmd_status(target: &WorkspaceArgs) -> Result<i32> {
    let cfg = target.load_config()?;
    let state_dir = cfg.state_dir_in(&target.workspace);
    let state = load_run_state(&plan_path(&state_dir))?;
    println!("run_id={}", state.run_id);
    println!("updated_at={}", state.updated_at.to_rfc3339());
    for status in TaskStatus::ALL {
        let count = state.plan.count(status);
        if count > 0 {
            println!("{status}={count}");
        }
    }
    if let Some(run_id) = latest_run_id(&state_dir)? {
        let path = RunLogPaths::new(&state_dir, &run_id).outcome_path();
        if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            let outcome: RunOutcome = serde_json::from_str(&raw)
                .with_context(|| format!("parse {}", path.display()))?;
            println!("last_verdict={}", outcome.verdict.as_str());
            println!("last_stop_reason={}", outcome.stop_reason.as_str());
        }
    }
    Ok(exit_codes::OK)
}

fn decompose(
    cfg: &ForemanConfig,
    workspace: &Path,
    analysis: &RequirementAnalysis,
) -> Result<Plan> {
    let catalog = load_catalog(cfg, workspace)?;
    let plan = TaskOrchestrator::new(catalog).decompose(analysis)?;
    info!(
        project_type = %analysis.project_type,
        tasks = plan.len(),
        "plan created"
    );
    Ok(plan)
}
