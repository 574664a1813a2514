use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use maestro::collab::{AgentRegistry, ProcessAgent, ProcessBuildRunner, ProcessTestRunner};
use maestro::config::Config;
use maestro::core::graph::graph_from_specs;
use maestro::core::task::{Role, TaskSpec};
use maestro::orchestration::engine::{OrchestrationLoop, RunSnapshot};
use maestro::orchestration::scheduler::AgentScheduler;
use maestro::orchestration::slots::SlotPool;
use maestro::validation::composition::CompositionValidator;
use maestro::validation::pipeline::ValidationPipeline;
use maestro::{mlog, Error, RepoOps, Result};

const ROLES: [Role; 4] = [
    Role::Architect,
    Role::Developer,
    Role::Tester,
    Role::Integrator,
];

/// Maestro - task-graph orchestration for autonomous coding agents
#[derive(Parser, Debug)]
#[command(name = "maestro")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    MAESTRO_DEBUG=1    Enable debug logging (alternative to --debug)")]
struct Cli {
    /// Enable debug logging (writes to ~/.maestro/maestro.log)
    #[arg(short = 'd', long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a plan against a repository
    Run {
        /// One-line description of what the run is for
        goal: String,

        /// Plan file: a JSON array of tasks with dependencies
        #[arg(long)]
        plan: PathBuf,

        /// Repository to orchestrate (defaults to the current directory)
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Override the configured round budget
        #[arg(long)]
        max_rounds: Option<u32>,

        /// Override the configured cost budget (assignment attempts)
        #[arg(long)]
        max_cost: Option<u64>,
    },
    /// Parse a plan file and report its structure without running it
    PlanCheck {
        /// Plan file to check
        plan: PathBuf,
    },
    /// Show the latest run snapshot
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    maestro::log::init_with_debug(cli.debug);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            goal,
            plan,
            repo,
            max_rounds,
            max_cost,
        } => run(goal, plan, repo, max_rounds, max_cost).await,
        Command::PlanCheck { plan } => plan_check(plan),
        Command::Status => status(),
    }
}

fn load_plan(path: &PathBuf) -> Result<Vec<TaskSpec>> {
    let text = std::fs::read_to_string(path)?;
    let specs: Vec<TaskSpec> = serde_json::from_str(&text)?;
    if specs.is_empty() {
        return Err(Error::InvalidPlan("plan contains no tasks".to_string()));
    }
    Ok(specs)
}

async fn run(
    goal: String,
    plan: PathBuf,
    repo: Option<PathBuf>,
    max_rounds: Option<u32>,
    max_cost: Option<u64>,
) -> Result<i32> {
    let mut config = Config::load()?;
    if let Some(rounds) = max_rounds {
        config.max_rounds = rounds;
    }
    if let Some(cost) = max_cost {
        config.max_cost_units = cost;
    }
    config.ensure_dirs()?;

    let specs = load_plan(&plan)?;
    let graph = graph_from_specs(&specs)?;
    mlog!(
        "Plan loaded: {} tasks, {} dependencies",
        graph.task_count(),
        graph.dependency_count()
    );

    if config.build_command.is_empty() {
        return Err(Error::Collaborator(
            "build_command is not configured".to_string(),
        ));
    }
    if config.test_command.is_empty() {
        return Err(Error::Collaborator(
            "test_command is not configured".to_string(),
        ));
    }

    let mut pool = SlotPool::new();
    let mut registry = AgentRegistry::new();
    for role in ROLES {
        let slots = config.slots_for(role);
        if slots == 0 {
            continue;
        }
        pool.add_slots(role, slots);
        let agent = ProcessAgent::new(config.effective_agent_command(), config.agent_args.clone())?
            .with_timeout(config.timeout_for(role));
        registry.register(role, Arc::new(agent));
    }

    let mut scheduler = AgentScheduler::new(pool, registry, config.timeout_for(Role::Developer));
    for role in ROLES {
        scheduler.set_role_timeout(role, config.timeout_for(role));
    }

    let build = ProcessBuildRunner::new(
        PathBuf::from(&config.build_command[0]),
        config.build_command[1..].to_vec(),
    )
    .with_timeout(config.command_timeout());
    let tests = ProcessTestRunner::new(
        PathBuf::from(&config.test_command[0]),
        config.test_command[1..].to_vec(),
    )
    .with_timeout(config.command_timeout());
    let pipeline = ValidationPipeline::new(Arc::new(build), Arc::new(tests));
    let composition = CompositionValidator::new(config.bisection_budget);

    let repo_path = match repo {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let repo = RepoOps::new(&repo_path)?;
    let worktrees_dir = config.worktrees_dir()?;
    let snapshot_path = Config::snapshot_path()?;

    let mut engine = OrchestrationLoop::new(
        goal,
        graph,
        scheduler,
        pipeline,
        composition,
        repo,
        config,
        worktrees_dir,
        Some(snapshot_path),
    )?;
    let summary = engine.run().await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(match summary.outcome {
        maestro::orchestration::RunOutcome::Completed => 0,
        _ => 2,
    })
}

fn plan_check(plan: PathBuf) -> Result<i32> {
    let specs = load_plan(&plan)?;
    let graph = graph_from_specs(&specs)?;

    println!(
        "plan ok: {} tasks, {} dependencies",
        graph.task_count(),
        graph.dependency_count()
    );
    let order = graph.topological_order()?;
    println!("execution order:");
    for id in order {
        if let Some(task) = graph.get_task(&id) {
            println!("  [{}] {} ({})", task.role, task.title, task.subsystem);
        }
    }
    let ready = graph.ready_tasks();
    println!("initially ready: {}", ready.len());
    for task in ready {
        println!("  {}", task.title);
    }
    Ok(0)
}

fn status() -> Result<i32> {
    let path = Config::snapshot_path()?;
    if !path.exists() {
        println!("no run snapshot at {}", path.display());
        return Ok(1);
    }
    let snapshot = RunSnapshot::load(&path)?;
    println!("goal: {}", snapshot.goal);
    println!(
        "round {} / cost {} / saved {}",
        snapshot.round, snapshot.cost_spent, snapshot.saved_at
    );
    match snapshot.outcome {
        Some(outcome) => println!("outcome: {}", outcome),
        None => println!("outcome: in progress"),
    }
    for task in &snapshot.tasks {
        let mut line = format!(
            "  {} [{}] {} - {}",
            task.id.short(),
            task.role,
            task.title,
            task.status
        );
        if task.retries > 0 {
            line.push_str(&format!(" (retries: {})", task.retries));
        }
        println!("{}", line);
        if let Some(reason) = &task.blocked_reason {
            println!("      blocked: {}", reason);
        }
    }
    if !snapshot.findings.is_empty() {
        println!("composition findings:");
        for finding in &snapshot.findings {
            println!(
                "  round {}: [{}] trigger={} ({:?}, {} probes)",
                finding.round,
                finding.subsystems.join(", "),
                finding.trigger,
                finding.severity,
                finding.probes_used
            );
            if !finding.regressed_tests.is_empty() {
                println!("    regressed: {}", finding.regressed_tests.join(", "));
            }
        }
    }
    Ok(0)
}
