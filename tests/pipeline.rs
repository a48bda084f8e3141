//! End-to-end coverage of the model -> unit -> unity -> actions -> cache/exec pipeline,
//! exercising the cooperating subsystems together rather than in isolation.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use ubuild_core::actions::{generate_target_actions, PayloadKind, TargetActions, TargetActionsNode};
use ubuild_core::alias::{AliasKind, BuildAlias};
use ubuild_core::cache::ActionCache;
use ubuild_core::compile_commands::{build_records, write_compile_commands};
use ubuild_core::contracts::{
    CacheMode, Compiler, DistMode, FileAccess, NullScmProbe, NullWorkerDispatcher, Permission, ProcessRunner,
};
use ubuild_core::error::Result;
use ubuild_core::exec::{ActionOutcome, ExecutionEngine, ExecutionStats, ProcessWorkerPool};
use ubuild_core::graph::Graph;
use ubuild_core::model::{Module, ModuleType};
use ubuild_core::registry::Registry;
use ubuild_core::unit::{expand_module, CompileEnv, DependencyResolver, ModuleNode, ModuleTable, Payload, PeerUnit, Unit};
use ubuild_core::unity::UnityPlan;

/// No module in these tests declares a dependency, so this resolver is never actually called;
/// it exists only to satisfy `expand_module`'s signature.
struct NoDeps;
impl DependencyResolver for NoDeps {
    fn resolve(&self, module_name: &str) -> Result<PeerUnit> {
        panic!("unexpected dependency lookup for `{module_name}`")
    }
}

struct StubCompiler;
impl Compiler for StubCompiler {
    fn extname(&self, payload: Payload) -> &str {
        match payload {
            Payload::ObjectList => ".o",
            Payload::StaticLib => ".a",
            _ => "",
        }
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
    fn source_dependencies(&self, action: ubuild_core::actions::Action) -> Result<ubuild_core::actions::Action> {
        Ok(action)
    }
    fn allow_caching(&self, _u: &ubuild_core::unit::Unit, _p: Payload) -> Permission {
        Permission::Allowed
    }
    fn allow_distribution(&self, _u: &ubuild_core::unit::Unit, _p: Payload) -> Permission {
        Permission::Inherit
    }
    fn allow_response_file(&self, _u: &ubuild_core::unit::Unit, _p: Payload) -> Permission {
        Permission::Inherit
    }
    fn allow_edit_and_continue(&self, _u: &ubuild_core::unit::Unit, _p: Payload) -> Permission {
        Permission::Inherit
    }
}

/// Copies a fake "object file" into place instead of actually invoking a compiler, so these
/// tests don't depend on a toolchain being installed.
struct CopyRunner;
impl ProcessRunner for CopyRunner {
    fn run(
        &self,
        _exe: &std::path::Path,
        args: &[String],
        _env: &[(String, String)],
        cwd: &std::path::Path,
        _use_response_file: bool,
        _hook: Option<&mut dyn FnMut(FileAccess)>,
    ) -> Result<std::process::ExitStatus> {
        // args: ["-c", "<input>", "-o", "<output>"], see StubCompiler's command templates below.
        let output = cwd.join(&args[3]);
        std::fs::write(&output, b"object code").map_err(|e| ubuild_core::error::Error::io(&output, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Ok(std::process::ExitStatus::from_raw(0))
        }
        #[cfg(not(unix))]
        {
            std::process::Command::new("cmd").arg("/C").arg("exit 0").status().map_err(|e| ubuild_core::error::Error::io(cwd, e))
        }
    }
}

/// Reports success without touching the filesystem, for exercising an action's execution
/// bookkeeping (graph edges, cache-miss path) without depending on the generated unit's
/// (relative, not rooted at any temp dir) working directory actually existing on disk.
struct NoopRunner;
impl ProcessRunner for NoopRunner {
    fn run(
        &self,
        _exe: &std::path::Path,
        _args: &[String],
        _env: &[(String, String)],
        _cwd: &std::path::Path,
        _use_response_file: bool,
        _hook: Option<&mut dyn FnMut(FileAccess)>,
    ) -> Result<std::process::ExitStatus> {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Ok(std::process::ExitStatus::from_raw(0))
        }
        #[cfg(not(unix))]
        {
            std::process::Command::new("cmd").arg("/C").arg("exit 0").status().map_err(|e| ubuild_core::error::Error::io(_cwd, e))
        }
    }
}

fn command_template(kind: PayloadKind) -> Vec<String> {
    match kind {
        PayloadKind::ObjectList => vec!["-c".into(), "%1".into(), "-o".into(), "%2".into()],
        _ => vec!["-o".into(), "%2".into()],
    }
}

#[test]
fn module_lowers_through_to_cached_object_actions() {
    let module = Module {
        name: "Widgets".into(),
        module_type: ModuleType::Library,
        source_files: vec![PathBuf::from("widget.cpp")],
        ..Default::default()
    };
    let env = CompileEnv { platform: "linux".into(), config: "release".into(), compiler: "cc".into(), tags: Default::default() };
    let registry = Registry::new();

    let unit = expand_module(&module, &env, &registry, &NoDeps).unwrap();
    assert_eq!(unit.payload, Payload::StaticLib);
    assert_eq!(unit.module_name, "Widgets");

    let unity_plan = UnityPlan::default();
    let target_actions = generate_target_actions(
        &unit,
        &unity_plan,
        &|name| PathBuf::from(format!("{name}.export")),
        &command_template,
        false,
    )
    .unwrap();

    // Unity is empty, so there are no post-unity object sources, but the unit's own payload
    // still gets its link action (with no object inputs to link against).
    let static_lib_payload = target_actions.payloads.iter().find(|p| p.kind == Some(PayloadKind::StaticLib)).unwrap();
    assert_eq!(static_lib_payload.action_aliases.len(), 1);

    // Build one ad hoc object-list action by hand through the execution engine, the way
    // `generate_target_actions` would for a non-empty unity plan, and confirm the cache round
    // trips: miss on first run, hit on the second with an identical input.
    let work_dir = tempfile::tempdir().unwrap();
    let source = work_dir.path().join("widget.cpp");
    std::fs::write(&source, "void widget() {}").unwrap();

    let action = ubuild_core::actions::Action {
        alias: ubuild_core::alias::BuildAlias::action("Widgets", "objlist", "0"),
        executable: PathBuf::from("cc"),
        args: vec!["-c".into(), "widget.cpp".into(), "-o".into(), "widget.o".into()],
        working_dir: work_dir.path().to_path_buf(),
        env: vec![],
        static_inputs: vec![source.clone()],
        dynamic_inputs: vec![],
        outputs: vec![work_dir.path().join("widget.o")],
        exports: vec![],
        extras: vec![],
        prerequisites: vec![],
        cache_mode: CacheMode::ReadWrite,
        dist_mode: DistMode::None,
        response_file: Permission::Inherit,
        edit_and_continue: Permission::Inherit,
        allow_relative_paths: false,
    };

    let cache_dir = tempfile::tempdir().unwrap();
    let engine = ExecutionEngine {
        cache: Arc::new(ActionCache::new(cache_dir.path(), 0)),
        worker_pool: Arc::new(ProcessWorkerPool::new(2)),
        dispatcher: Arc::new(NullWorkerDispatcher),
        process_runner: Arc::new(CopyRunner),
        scm: Arc::new(NullScmProbe),
        stats: Arc::new(ExecutionStats::default()),
    };
    let compiler = StubCompiler;

    engine.build_action(action.clone(), &compiler, work_dir.path(), false).unwrap();
    assert_eq!(engine.stats.cache_misses.load(Ordering::Relaxed), 1);
    assert_eq!(engine.stats.cache_hits.load(Ordering::Relaxed), 0);

    std::fs::remove_file(work_dir.path().join("widget.o")).unwrap();

    // Cache writes are asynchronous; the write is the only outstanding background work these
    // tests perform, so a short, generous sleep is sufficient before checking for a hit.
    std::thread::sleep(std::time::Duration::from_millis(200));

    engine.build_action(action, &compiler, work_dir.path(), false).unwrap();
    assert_eq!(engine.stats.cache_hits.load(Ordering::Relaxed), 1);
    assert!(work_dir.path().join("widget.o").exists(), "cache hit should have restored the object file");
}

#[test]
fn compile_commands_written_for_object_list_actions() {
    let action = ubuild_core::actions::Action {
        alias: ubuild_core::alias::BuildAlias::action("Widgets", "objlist", "0"),
        executable: PathBuf::from("cc"),
        args: vec!["-c".into(), "widget.cpp".into(), "-o".into(), "widget.o".into()],
        working_dir: PathBuf::from("/src"),
        env: vec![],
        static_inputs: vec![PathBuf::from("widget.cpp")],
        dynamic_inputs: vec![],
        outputs: vec![PathBuf::from("widget.o")],
        exports: vec![],
        extras: vec![],
        prerequisites: vec![],
        cache_mode: CacheMode::ReadWrite,
        dist_mode: DistMode::None,
        response_file: Permission::Inherit,
        edit_and_continue: Permission::Inherit,
        allow_relative_paths: false,
    };

    let records = build_records(&[action], &UnityPlan::default());
    assert_eq!(records.len(), 1);

    let out_dir = tempfile::tempdir().unwrap();
    let path = write_compile_commands(out_dir.path(), "linux", "release", &records).unwrap();
    assert_eq!(path, out_dir.path().join("linux").join("release").join("compile_commands.json"));

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("widget.cpp"));
    assert!(contents.contains("widget.o"));
}

/// Drives the whole pipeline through the build graph itself, rather than calling
/// `expand_module`/`generate_target_actions`/`build_action` by hand: registers a `Module`,
/// `need`s its lowered `Unit`, registers the resulting `TargetActions`, and `need`s one of its
/// link actions, confirming each stage is reachable only through `Graph::need`.
#[test]
fn graph_drives_module_through_lowering_action_generation_and_execution() {
    let module = Arc::new(Module {
        name: "Widgets".into(),
        module_type: ModuleType::Library,
        source_files: vec![PathBuf::from("widget.cpp")],
        ..Default::default()
    });
    let env = CompileEnv { platform: "linux".into(), config: "release".into(), compiler: "cc".into(), tags: Default::default() };
    let registry = Arc::new(Registry::new());

    let mut modules = ModuleTable::new();
    modules.insert(module.name.clone(), module.clone());
    let modules = Arc::new(modules);

    let graph = Graph::new();
    let unit_alias = BuildAlias::unit(&module.name, &env.tag());
    graph.register(Arc::new(ModuleNode { module: module.clone(), env: env.clone(), registry: registry.clone(), modules }));

    let unit: Arc<Unit> = graph.need(&unit_alias).unwrap();
    assert_eq!(unit.payload, Payload::StaticLib);

    let work_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ExecutionEngine {
        cache: Arc::new(ActionCache::new(cache_dir.path(), 0)),
        worker_pool: Arc::new(ProcessWorkerPool::new(2)),
        dispatcher: Arc::new(NullWorkerDispatcher),
        process_runner: Arc::new(NoopRunner),
        scm: Arc::new(NullScmProbe),
        stats: Arc::new(ExecutionStats::default()),
    });
    let compiler: Arc<dyn Compiler> = Arc::new(StubCompiler);

    let target_actions_alias = BuildAlias::new(AliasKind::TargetActions, [module.name.clone(), env.tag()]);
    graph.register(Arc::new(TargetActionsNode {
        unit_alias: unit_alias.clone(),
        env_tag: env.tag(),
        unity_plan: UnityPlan::default(),
        command_template: Arc::new(command_template),
        engine: engine.clone(),
        compiler: compiler.clone(),
        dest_root: work_dir.path().to_path_buf(),
        supports_file_access_tracing: false,
    }));

    // Unity is empty, so there are no object-list actions, but the unit's own static-lib link
    // action is still generated and registered as its own `ActionNode` by `TargetActionsNode`.
    let target_actions: Arc<TargetActions> = graph.need(&target_actions_alias).unwrap();
    let static_lib_payload = target_actions.payloads.iter().find(|p| p.kind == Some(PayloadKind::StaticLib)).unwrap();
    assert_eq!(static_lib_payload.action_aliases.len(), 1);
    assert_eq!(target_actions.actions.len(), 1);

    // The link action's own alias was registered as an `ActionNode` by `TargetActionsNode::build`
    // above; fetch it through `Graph::need` rather than calling `ExecutionEngine::build_action`
    // directly, confirming the action is reachable purely through the graph.
    let action_alias = static_lib_payload.action_aliases[0].clone();
    let outcome: Arc<ActionOutcome> = graph.need(&action_alias).unwrap();
    assert!(matches!(*outcome, ActionOutcome::Ran { .. }));
}
