//! Test fixtures for integration tests.
//!
//! Provides temporary git repositories, scripted agents, and stub build and
//! test runners so full engine runs execute without real subprocesses.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use git2::{IndexAddOption, Repository, Signature};
use tempfile::TempDir;

use maestro::collab::{AgentOutcome, AgentRegistry, AgentRunner, BuildRunner, TestRunner};
use maestro::config::Config;
use maestro::core::graph::TaskGraph;
use maestro::core::task::{Role, Task, TaskId};
use maestro::error::Result;
use maestro::orchestration::engine::OrchestrationLoop;
use maestro::orchestration::scheduler::AgentScheduler;
use maestro::orchestration::slots::SlotPool;
use maestro::validation::composition::CompositionValidator;
use maestro::validation::pipeline::ValidationPipeline;
use maestro::validation::report::{BuildOutcome, TestOutcome};
use maestro::RepoOps;

/// A temporary git repository with an initial commit.
pub struct TestRepo {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("repo");
        std::fs::create_dir_all(&path).expect("Failed to create repo directory");

        let repo = Repository::init(&path).expect("Failed to init repository");
        let sig = Signature::now("test", "test@test.com").expect("Failed to create signature");
        std::fs::write(path.join("README.md"), "seed\n").expect("Failed to write seed file");
        let mut index = repo.index().expect("Failed to get index");
        index
            .add_all(["."].iter(), IndexAddOption::DEFAULT, None)
            .expect("Failed to add files");
        index.write().expect("Failed to write index");
        let tree_id = index.write_tree().expect("Failed to write tree");
        let tree = repo.find_tree(tree_id).expect("Failed to find tree");
        repo.commit(Some("HEAD"), &sig, &sig, "seed", &tree, &[])
            .expect("Failed to create seed commit");

        Self { temp_dir, path }
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.temp_dir.path().join("worktrees")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.temp_dir.path().join("run.json")
    }

    /// Path of the integration worktree the engine maintains.
    pub fn integration_dir(&self) -> PathBuf {
        self.worktrees_dir().join("integration")
    }
}

/// Config tuned for fast test runs.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry_budget = 2;
    config.stall_threshold = 3;
    config.max_rounds = 20;
    config.max_cost_units = 50;
    config.bisection_budget = 8;
    config
}

/// Agent that writes `<subsystem>.txt` into its worktree, with the content
/// tracking how many attempts this task has made.
pub struct WriterAgent {
    attempts: Mutex<HashMap<TaskId, u32>>,
}

impl WriterAgent {
    pub fn new() -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AgentRunner for WriterAgent {
    async fn run(&self, task: &Task, workdir: &Path) -> Result<AgentOutcome> {
        let attempt = {
            let mut attempts = self.attempts.lock().expect("attempts lock poisoned");
            let n = attempts.entry(task.id).or_insert(0);
            *n += 1;
            *n
        };
        std::fs::write(
            workdir.join(format!("{}.txt", task.subsystem)),
            format!("v{}\n", attempt),
        )?;
        Ok(AgentOutcome {
            success: true,
            change_set: None,
            diagnostics: format!("wrote {}.txt (attempt {})", task.subsystem, attempt),
        })
    }
}

/// Agent that records what it saw in the worktree before writing its file.
/// Used to check that later tasks build on earlier tasks' landed changes.
pub struct ObservantAgent {
    pub depends_on_file: String,
}

#[async_trait]
impl AgentRunner for ObservantAgent {
    async fn run(&self, task: &Task, workdir: &Path) -> Result<AgentOutcome> {
        let saw = workdir.join(&self.depends_on_file).exists();
        std::fs::write(
            workdir.join(format!("{}.txt", task.subsystem)),
            if saw { "saw-dep\n" } else { "missing-dep\n" },
        )?;
        Ok(AgentOutcome {
            success: true,
            change_set: None,
            diagnostics: String::new(),
        })
    }
}

/// WriterAgent with a per-subsystem delay before finishing, so completion
/// order (and therefore land order) is deterministic across a round. The
/// instant each subsystem's run began is recorded for latency assertions.
pub struct OrderedWriterAgent {
    delays_ms: HashMap<String, u64>,
    pub started: Mutex<HashMap<String, Instant>>,
    inner: WriterAgent,
}

impl OrderedWriterAgent {
    pub fn new(delays_ms: &[(&str, u64)]) -> Self {
        Self {
            delays_ms: delays_ms
                .iter()
                .map(|(s, d)| (s.to_string(), *d))
                .collect(),
            started: Mutex::new(HashMap::new()),
            inner: WriterAgent::new(),
        }
    }
}

#[async_trait]
impl AgentRunner for OrderedWriterAgent {
    async fn run(&self, task: &Task, workdir: &Path) -> Result<AgentOutcome> {
        self.started
            .lock()
            .expect("started lock poisoned")
            .entry(task.subsystem.clone())
            .or_insert_with(Instant::now);
        if let Some(ms) = self.delays_ms.get(&task.subsystem) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        self.inner.run(task, workdir).await
    }
}

/// Agent that writes its subsystem name into a shared file, so two tasks
/// from different subsystems collide on the same path.
pub struct SharedFileAgent {
    pub file: String,
}

#[async_trait]
impl AgentRunner for SharedFileAgent {
    async fn run(&self, task: &Task, workdir: &Path) -> Result<AgentOutcome> {
        std::fs::write(
            workdir.join(&self.file),
            format!("{}\n", task.subsystem),
        )?;
        Ok(AgentOutcome {
            success: true,
            change_set: None,
            diagnostics: String::new(),
        })
    }
}

/// Agent that writes a file and reports its own change-set reference, the
/// way an external review system would.
pub struct ReportingAgent {
    pub reference: String,
}

#[async_trait]
impl AgentRunner for ReportingAgent {
    async fn run(&self, task: &Task, workdir: &Path) -> Result<AgentOutcome> {
        std::fs::write(workdir.join(format!("{}.txt", task.subsystem)), "done\n")?;
        Ok(AgentOutcome::success(
            self.reference.clone(),
            format!("wrote {}.txt", task.subsystem),
        ))
    }
}

/// Agent that always reports failure without changing the tree.
pub struct FailingAgent;

#[async_trait]
impl AgentRunner for FailingAgent {
    async fn run(&self, _task: &Task, _workdir: &Path) -> Result<AgentOutcome> {
        Ok(AgentOutcome::failure("could not complete the task"))
    }
}

/// Agent that never finishes; exists to exercise timeouts.
pub struct HangingAgent;

#[async_trait]
impl AgentRunner for HangingAgent {
    async fn run(&self, _task: &Task, _workdir: &Path) -> Result<AgentOutcome> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(AgentOutcome::failure("unreachable"))
    }
}

/// Agent wrapper that tracks the peak number of concurrent executions.
pub struct ConcurrencyTrackingAgent {
    inner: Arc<dyn AgentRunner>,
    current: AtomicUsize,
    pub peak: AtomicUsize,
}

impl ConcurrencyTrackingAgent {
    pub fn new(inner: Arc<dyn AgentRunner>) -> Self {
        Self {
            inner,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AgentRunner for ConcurrencyTrackingAgent {
    async fn run(&self, task: &Task, workdir: &Path) -> Result<AgentOutcome> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        // Hold the slot briefly so overlapping assignments would be seen.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = self.inner.run(task, workdir).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Build runner that always succeeds.
pub struct PassBuild;

#[async_trait]
impl BuildRunner for PassBuild {
    async fn build(&self, _workdir: &Path) -> Result<BuildOutcome> {
        Ok(BuildOutcome::ok())
    }
}

/// Test runner scripted by a predicate over the validated tree: returning
/// `Some(reason)` fails the suite, `None` passes it.
pub struct ConditionalTests {
    check: Box<dyn Fn(&Path) -> Option<String> + Send + Sync>,
}

impl ConditionalTests {
    pub fn new(check: impl Fn(&Path) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            check: Box::new(check),
        }
    }

    pub fn always_pass() -> Self {
        Self::new(|_| None)
    }
}

#[async_trait]
impl TestRunner for ConditionalTests {
    async fn run_tests(&self, workdir: &Path) -> Result<Vec<TestOutcome>> {
        Ok(match (self.check)(workdir) {
            Some(reason) => vec![TestOutcome::failed("suite", reason)],
            None => vec![TestOutcome::passed("suite")],
        })
    }
}

/// Read a file from a directory, if present.
pub fn read_file(dir: &Path, name: &str) -> Option<String> {
    std::fs::read_to_string(dir.join(name)).ok()
}

/// Wire an engine together with uniform agents for every role the graph
/// uses, one slot per role unless overridden.
pub struct EngineBuilder {
    pub repo: TestRepo,
    pub config: Config,
    agent: Arc<dyn AgentRunner>,
    tests: Arc<dyn TestRunner>,
    slots: HashMap<Role, usize>,
    role_timeout: Option<Duration>,
}

impl EngineBuilder {
    pub fn new(agent: Arc<dyn AgentRunner>) -> Self {
        Self {
            repo: TestRepo::new(),
            config: test_config(),
            agent,
            tests: Arc::new(ConditionalTests::always_pass()),
            slots: HashMap::new(),
            role_timeout: None,
        }
    }

    pub fn with_tests(mut self, tests: Arc<dyn TestRunner>) -> Self {
        self.tests = tests;
        self
    }

    pub fn with_slots(mut self, role: Role, count: usize) -> Self {
        self.slots.insert(role, count);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.role_timeout = Some(timeout);
        self
    }

    pub fn with_config(mut self, f: impl FnOnce(&mut Config)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn build(self, goal: &str, graph: TaskGraph) -> (OrchestrationLoop, TestRepo) {
        let roles = [
            Role::Architect,
            Role::Developer,
            Role::Tester,
            Role::Integrator,
        ];
        let mut pool = SlotPool::new();
        let mut registry = AgentRegistry::new();
        for role in roles {
            let count = self.slots.get(&role).copied().unwrap_or(1);
            pool.add_slots(role, count);
            registry.register(role, self.agent.clone());
        }

        let default_timeout = self.role_timeout.unwrap_or(Duration::from_secs(10));
        let scheduler = AgentScheduler::new(pool, registry, default_timeout);

        let pipeline = ValidationPipeline::new(Arc::new(PassBuild), self.tests);
        let composition = CompositionValidator::new(self.config.bisection_budget);
        let repo_ops = RepoOps::new(&self.repo.path).expect("Failed to open test repo");

        let engine = OrchestrationLoop::new(
            goal,
            graph,
            scheduler,
            pipeline,
            composition,
            repo_ops,
            self.config,
            self.repo.worktrees_dir(),
            Some(self.repo.snapshot_path()),
        )
        .expect("Failed to build engine");
        (engine, self.repo)
    }
}

/// Build a graph of tasks from (title, role, subsystem, deps-by-title).
pub fn graph_of(tasks: &[(&str, Role, &str, &[&str])]) -> (TaskGraph, HashMap<String, TaskId>) {
    let mut graph = TaskGraph::new();
    let mut ids: HashMap<String, TaskId> = HashMap::new();
    for (title, role, subsystem, deps) in tasks {
        let task = Task::new(title, &format!("{} description", title), *role, subsystem);
        let deps: Vec<TaskId> = deps.iter().map(|d| ids[*d]).collect();
        ids.insert(title.to_string(), task.id);
        graph.add_task(task, &deps).expect("Failed to add task");
    }
    (graph, ids)
}
