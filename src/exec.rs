//! Action execution engine: runs the declare-inputs/fingerprint/cache-lookup/
//! run-or-dispatch state machine for a single [`Action`], consulting the cache first and
//! falling back from remote dispatch to local execution.

use std::any::Any;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::actions::Action;
use crate::cache::{bulk::ArtifactFile, ActionCache, CacheLookup, FileDigest};
use crate::contracts::{CacheMode, Compiler, DispatchOutcome, FileAccess, ProcessRunner, ScmProbe, WorkerDispatcher};
use crate::error::{Error, Result};
use crate::graph::{debug_fingerprint, BuildContext, Buildable};

/// A simple counting semaphore gating concurrent external-process invocations, independent of
/// the graph's own node-build parallelism, so compiler/linker processes can be capped
/// separately from in-process build concurrency.
pub struct ProcessWorkerPool {
    available: Mutex<usize>,
    condvar: Condvar,
}

impl ProcessWorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self { available: Mutex::new(capacity.max(1)), condvar: Condvar::new() }
    }

    /// Sized from hardware parallelism unless overridden, matching the graph pool's own default.
    pub fn with_default_capacity() -> Self {
        Self::new(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
    }

    /// Blocks until a permit is available, runs `f`, then releases the permit. FIFO-ness is
    /// only approximated by the `Condvar`'s own wake order.
    pub fn with_permit<T>(&self, f: impl FnOnce() -> T) -> T {
        {
            let mut guard = self.available.lock().unwrap();
            while *guard == 0 {
                guard = self.condvar.wait(guard).unwrap();
            }
            *guard -= 1;
        }
        let result = f();
        {
            let mut guard = self.available.lock().unwrap();
            *guard += 1;
        }
        self.condvar.notify_one();
        result
    }
}

/// Running counters surfaced for diagnostics and exercised by the cache-hit/remote-fallback
/// integration tests.
#[derive(Default)]
pub struct ExecutionStats {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub remote_failures: AtomicU64,
}

/// Outcome of running one action to completion.
pub enum ActionOutcome {
    CacheHit { restored: Vec<PathBuf> },
    Ran { remote: bool },
}

/// Ties together the cache, worker pool, dispatcher, and process runner to execute actions
/// through the declare/fingerprint/lookup/run-or-dispatch/persist sequence.
pub struct ExecutionEngine {
    pub cache: Arc<ActionCache>,
    pub worker_pool: Arc<ProcessWorkerPool>,
    pub dispatcher: Arc<dyn WorkerDispatcher>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub scm: Arc<dyn ScmProbe>,
    pub stats: Arc<ExecutionStats>,
}

impl ExecutionEngine {
    /// Runs `action`'s full state machine and returns once outputs are committed. Schedules the
    /// cache write asynchronously on a detached thread so it never blocks the caller.
    ///
    /// `supports_file_access_tracing` mirrors `Platform::supports_file_access_tracing`: when
    /// `true`, the process runner is given a hook that records every file the subprocess reads,
    /// and those reads become part of the cache key's actual-input superset; when `false`, the
    /// action is first rewritten through `compiler.source_dependencies` to declare its real
    /// dependency set up front, since no OS-level tracing is available to discover it at run time.
    #[tracing::instrument(skip_all, fields(alias = %action.alias))]
    pub fn build_action(
        &self,
        mut action: Action,
        compiler: &dyn Compiler,
        dest_root: &std::path::Path,
        supports_file_access_tracing: bool,
    ) -> Result<ActionOutcome> {
        action.apply_edit_and_continue_workaround();
        if !supports_file_access_tracing {
            action = compiler.source_dependencies(action)?;
        }

        // START: declare inputs as dynamic file deps.
        let declared_paths: Vec<PathBuf> = action.declared_inputs().cloned().collect();
        let declared_digests: Result<Vec<FileDigest>> = declared_paths
            .iter()
            .map(|p| self.cache.digest_memo().digest(p).map_err(|e| Error::io(p, e)))
            .collect();
        let declared_digests = declared_digests?;

        let effective_mode = self.cache.effective_cache_mode(&declared_paths, action.cache_mode, self.scm.as_ref());
        let key = self.cache.compute_action_key(&ActionRulesView::new(&action), &declared_digests);

        // LOOKUP.
        if effective_mode.can_read() {
            match self.cache.cache_read(key, &declared_digests, dest_root) {
                CacheLookup::Hit { restored } => {
                    self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(ActionOutcome::CacheHit { restored });
                }
                CacheLookup::Miss => {
                    self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // RUN: remote dispatch first, falling back to local unless forced.
        let mut remote = false;
        let ran_remotely = if action.dist_mode.wants_remote() {
            let forced = action.dist_mode.is_forced();
            if self.dispatcher.can_distribute(forced) {
                match self.dispatcher.dispatch(&action.executable, &action.args, &action.working_dir) {
                    Ok(DispatchOutcome::Ran { status, .. }) => {
                        remote = true;
                        if !status.success() {
                            return Err(Error::Compile {
                                command: format_command(&action),
                                stderr: "remote execution failed".into(),
                            });
                        }
                        true
                    }
                    Ok(DispatchOutcome::NotDispatched) => {
                        self.stats.remote_failures.fetch_add(1, Ordering::Relaxed);
                        if forced {
                            return Err(Error::Compile { command: format_command(&action), stderr: "remote dispatch forced but declined".into() });
                        }
                        tracing::warn!(alias = %action.alias, "remote dispatch declined, falling back to local execution");
                        false
                    }
                    Err(err) => {
                        self.stats.remote_failures.fetch_add(1, Ordering::Relaxed);
                        if forced {
                            return Err(err);
                        }
                        tracing::warn!(alias = %action.alias, %err, "remote dispatch failed, falling back to local execution");
                        false
                    }
                }
            } else {
                false
            }
        } else {
            false
        };

        let mut traced_accesses: Vec<FileAccess> = Vec::new();
        if !ran_remotely {
            let use_respfile = action.response_file == crate::contracts::Permission::Allowed;
            let status = self.worker_pool.with_permit(|| {
                if supports_file_access_tracing {
                    let mut hook = |access: FileAccess| traced_accesses.push(access);
                    self.process_runner.run(&action.executable, &action.args, &action.env, &action.working_dir, use_respfile, Some(&mut hook))
                } else {
                    self.process_runner.run(&action.executable, &action.args, &action.env, &action.working_dir, use_respfile, None)
                }
            })?;
            if !status.success() {
                return Err(Error::Compile { command: format_command(&action), stderr: format!("exit status: {status}") });
            }
        }

        // The actual-input superset: declared inputs plus, when tracing is available, every
        // file the subprocess actually read that wasn't already declared.
        let mut actual_inputs = declared_digests.clone();
        for access in &traced_accesses {
            if access.write || actual_inputs.iter().any(|d| d.path == access.path) {
                continue;
            }
            if let Ok(digest) = self.cache.digest_memo().digest(&access.path) {
                actual_inputs.push(digest);
            }
        }

        // COMMIT + ASYNC cache write.
        if effective_mode.can_write() {
            let cache = Arc::clone(&self.cache);
            let artifacts: Result<Vec<ArtifactFile>> = action
                .outputs
                .iter()
                .chain(action.exports.iter())
                .chain(action.extras.iter())
                .map(|p| {
                    let meta = std::fs::metadata(p).map_err(|e| Error::io(p, e))?;
                    let mtime = meta.modified().map_err(|e| Error::io(p, e))?;
                    Ok(ArtifactFile {
                        relative_path: p.strip_prefix(dest_root).unwrap_or(p).to_path_buf(),
                        absolute_path: p.clone(),
                        mtime,
                    })
                })
                .collect();
            if let Ok(artifacts) = artifacts {
                std::thread::spawn(move || {
                    cache.cache_write(key, &actual_inputs, &artifacts);
                });
            }
        }

        Ok(ActionOutcome::Ran { remote: ran_remotely || remote })
    }
}

/// Drives one [`Action`] through [`ExecutionEngine::build_action`] as a graph node. Establishes
/// both kinds of edges the generator itself can't: a static `depends_on` edge per declared
/// prerequisite action, and a dynamic `need_file` edge per declared input, so early-cutoff
/// invalidation sees source edits without the owning [`crate::actions::TargetActionsNode`] having
/// to recompute anything.
pub struct ActionNode {
    pub action: Action,
    pub engine: Arc<ExecutionEngine>,
    pub compiler: Arc<dyn Compiler>,
    pub dest_root: PathBuf,
    pub supports_file_access_tracing: bool,
}

impl Buildable for ActionNode {
    fn alias(&self) -> crate::alias::BuildAlias {
        self.action.alias.clone()
    }

    fn state_fingerprint(&self) -> u64 {
        debug_fingerprint(&self.action)
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<Arc<dyn Any + Send + Sync>> {
        for prereq in &self.action.prerequisites {
            ctx.depends_on(prereq)?;
        }
        for input in self.action.declared_inputs() {
            ctx.need_file(input)?;
        }
        let outcome = self.engine.build_action(self.action.clone(), self.compiler.as_ref(), &self.dest_root, self.supports_file_access_tracing)?;
        Ok(Arc::new(outcome))
    }
}

fn format_command(action: &Action) -> String {
    format!("{} {}", action.executable.display(), action.args.join(" "))
}

/// A stable view of an action's rules for fingerprinting, deliberately excluding
/// `working_dir`/`env` so the same logical action keeps the same key across machines with
/// different absolute paths (when `allow_relative_paths` is set) or environment noise.
#[derive(serde::Serialize)]
struct ActionRulesView<'a> {
    executable: &'a std::path::Path,
    args: &'a [String],
    outputs: &'a [PathBuf],
    exports: &'a [PathBuf],
    extras: &'a [PathBuf],
}

impl<'a> ActionRulesView<'a> {
    fn new(action: &'a Action) -> Self {
        Self {
            executable: &action.executable,
            args: &action.args,
            outputs: &action.outputs,
            exports: &action.exports,
            extras: &action.extras,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{FileAccess, NullScmProbe, NullWorkerDispatcher};
    use crate::unit::Payload;
    use std::process::ExitStatus;

    struct FakeCompiler;
    impl Compiler for FakeCompiler {
        fn extname(&self, _payload: Payload) -> &str {
            ".o"
        }
        fn define_flags(&self, _d: &[String]) -> Vec<String> {
            vec![]
        }
        fn include_flags(&self, _d: &[PathBuf]) -> Vec<String> {
            vec![]
        }
        fn library_flags(&self, _d: &[String]) -> Vec<String> {
            vec![]
        }
        fn force_include_flags(&self, _d: &[PathBuf]) -> Vec<String> {
            vec![]
        }
        fn system_include_flags(&self, _d: &[PathBuf]) -> Vec<String> {
            vec![]
        }
        fn library_path_flags(&self, _d: &[PathBuf]) -> Vec<String> {
            vec![]
        }
        fn source_dependencies(&self, action: Action) -> Result<Action> {
            Ok(action)
        }
        fn allow_caching(&self, _u: &crate::unit::Unit, _p: Payload) -> crate::contracts::Permission {
            crate::contracts::Permission::Allowed
        }
        fn allow_distribution(&self, _u: &crate::unit::Unit, _p: Payload) -> crate::contracts::Permission {
            crate::contracts::Permission::Allowed
        }
        fn allow_response_file(&self, _u: &crate::unit::Unit, _p: Payload) -> crate::contracts::Permission {
            crate::contracts::Permission::Inherit
        }
        fn allow_edit_and_continue(&self, _u: &crate::unit::Unit, _p: Payload) -> crate::contracts::Permission {
            crate::contracts::Permission::Inherit
        }
    }

    struct TrueRunner;
    impl ProcessRunner for TrueRunner {
        fn run(
            &self,
            _exe: &std::path::Path,
            _args: &[String],
            _env: &[(String, String)],
            _cwd: &std::path::Path,
            _use_response_file: bool,
            _hook: Option<&mut dyn FnMut(FileAccess)>,
        ) -> Result<ExitStatus> {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                Ok(ExitStatus::from_raw(0))
            }
            #[cfg(not(unix))]
            {
                std::process::Command::new("cmd").arg("/C").arg("exit 0").status().map_err(|e| Error::io(_exe, e))
            }
        }
    }

    fn engine() -> ExecutionEngine {
        ExecutionEngine {
            cache: Arc::new(ActionCache::new(tempfile::tempdir().unwrap().into_path(), 0)),
            worker_pool: Arc::new(ProcessWorkerPool::new(2)),
            dispatcher: Arc::new(NullWorkerDispatcher),
            process_runner: Arc::new(TrueRunner),
            scm: Arc::new(NullScmProbe),
            stats: Arc::new(ExecutionStats::default()),
        }
    }

    #[test]
    fn remote_dispatch_decline_falls_back_to_local_and_counts_failure() {
        let dest = tempfile::tempdir().unwrap();
        let src = dest.path().join("a.cpp");
        std::fs::write(&src, "int main(){}").unwrap();
        let action = Action {
            alias: crate::alias::BuildAlias::action("Foo", "objlist", "0"),
            executable: PathBuf::from("/bin/true"),
            args: vec![],
            working_dir: dest.path().to_path_buf(),
            env: vec![],
            static_inputs: vec![src.clone()],
            dynamic_inputs: vec![],
            outputs: vec![],
            exports: vec![],
            extras: vec![],
            prerequisites: vec![],
            cache_mode: CacheMode::None,
            dist_mode: crate::contracts::DistMode::Enable,
            response_file: crate::contracts::Permission::Inherit,
            edit_and_continue: crate::contracts::Permission::Inherit,
            allow_relative_paths: false,
        };
        let engine = engine();
        let compiler = FakeCompiler;
        let outcome = engine.build_action(action, &compiler, dest.path(), false).unwrap();
        assert!(matches!(outcome, ActionOutcome::Ran { remote: false }));
        assert_eq!(engine.stats.remote_failures.load(Ordering::Relaxed), 1);
    }
}
