//! The build graph: `Node`s keyed by [`BuildAlias`], each wrapping a
//! [`Buildable`] payload, with at-most-one-build-in-flight coalescing per alias and
//! early-cutoff invalidation.
//!
//! `Buildable` payloads are stored as `Arc<dyn Any + Send + Sync>` rather than a single tagged
//! enum covering every node kind in the crate (`Module`, `Unit`, `TargetActions`, `Action`,
//! `UnityFile`...) — a tagged enum would force this module to depend on every other module's
//! types, where right now only `unit.rs`/`actions.rs`/`exec.rs` depend on `graph.rs` and not the
//! reverse. Each domain type is driven through the graph by a thin wrapper that owns the
//! recipe `build` needs: `unit::ModuleNode` lowers a `Module` into a `Unit`,
//! `actions::TargetActionsNode` lowers a `Unit` into its `TargetActions`, and `exec::ActionNode`
//! executes one `Action`. Callers downcast the result with [`Graph::need`].

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::alias::BuildAlias;
use crate::cache::digest::{DigestMemo, FileDigest};
use crate::error::{Error, Result};

/// One buildable node payload. Implementors are typically thin wrappers the higher-level
/// modules (`unit::Unit`, `actions::Action`, `unity::UnityFile`, ...) register with the graph.
pub trait Buildable: Send + Sync {
    fn alias(&self) -> BuildAlias;

    /// A hash of this buildable's own declarative rules, independent of its dependencies'
    /// content. Two buildables with the same alias but different `state_fingerprint` are
    /// treated as though the alias's recipe itself changed (e.g. a module's source list was
    /// edited).
    fn state_fingerprint(&self) -> u64;

    fn build(&self, ctx: &BuildContext<'_>) -> Result<Arc<dyn Any + Send + Sync>>;
}

struct NodeSlot {
    value: Option<Arc<dyn Any + Send + Sync>>,
    state_fingerprint: u64,
    static_deps: Vec<(BuildAlias, u64)>,
    file_deps: Vec<FileDigest>,
    dir_deps: Vec<(PathBuf, [u8; 32])>,
    built_epoch: u64,
    annotations: Vec<String>,
}

impl Default for NodeSlot {
    fn default() -> Self {
        Self {
            value: None,
            state_fingerprint: 0,
            static_deps: Vec::new(),
            file_deps: Vec::new(),
            dir_deps: Vec::new(),
            built_epoch: 0,
            annotations: Vec::new(),
        }
    }
}

thread_local! {
    /// Aliases currently being built on this thread, to catch `need` cycles instead of
    /// deadlocking on a node's own per-alias lock.
    static BUILD_STACK: RefCell<Vec<BuildAlias>> = const { RefCell::new(Vec::new()) };
}

/// The build graph: owns every registered [`Buildable`] and its memoized [`NodeSlot`].
pub struct Graph {
    buildables: Mutex<HashMap<BuildAlias, Arc<dyn Buildable>>>,
    slots: Mutex<HashMap<BuildAlias, Arc<Mutex<NodeSlot>>>>,
    claimed_outputs: Mutex<HashMap<PathBuf, BuildAlias>>,
    digests: DigestMemo,
    epoch: AtomicU64,
    /// Runs every `build` callback, sized from hardware parallelism unless overridden,
    /// the same way the source tree's own `compile_parallel` builds a scoped
    /// `rayon::ThreadPoolBuilder` rather than relying on rayon's global pool.
    pool: rayon::ThreadPool,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::with_parallelism(threads)
    }

    pub fn with_parallelism(threads: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("ubuild-graph-{i}"))
            .build()
            .expect("building the graph's thread pool should never fail");
        Self {
            buildables: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            claimed_outputs: Mutex::new(HashMap::new()),
            digests: DigestMemo::new(),
            epoch: AtomicU64::new(0),
            pool,
        }
    }

    /// Registers `buildable` under its own alias, overwriting any prior registration for that
    /// alias (re-registration happens routinely — e.g. re-lowering a `Module` into a fresh
    /// `Unit` wrapper across builds — and is not itself an invalidation signal; only
    /// `state_fingerprint` changing is).
    pub fn register(&self, buildable: Arc<dyn Buildable>) {
        let alias = buildable.alias();
        self.buildables.lock().unwrap().insert(alias, buildable);
    }

    fn slot_for(&self, alias: &BuildAlias) -> Arc<Mutex<NodeSlot>> {
        let mut slots = self.slots.lock().unwrap();
        slots.entry(alias.clone()).or_default().clone()
    }

    /// Fetches or materializes the node at `alias`, downcasting its value to `T`. Fails with
    /// [`Error::configuration`] if the alias was never registered, with [`Error::dependency`] on
    /// a detected cycle, or with whatever `build` itself returned.
    pub fn need<T: Any + Send + Sync>(&self, alias: &BuildAlias) -> Result<Arc<T>> {
        let value = self.need_any(alias)?;
        value.downcast::<T>().map_err(|_| Error::configuration(format!("node `{alias}` built to an unexpected type")))
    }

    /// Registers `make()`'s result if `alias` is not yet registered, then [`Graph::need`]s it.
    pub fn need_factory<T: Any + Send + Sync>(&self, alias: &BuildAlias, make: impl FnOnce() -> Arc<dyn Buildable>) -> Result<Arc<T>> {
        let already = self.buildables.lock().unwrap().contains_key(alias);
        if !already {
            self.register(make());
        }
        self.need(alias)
    }

    /// Static predecessor edge: ensures `alias` is built, discarding its value. Unlike `need`,
    /// callers that only want to order themselves after another node (without consuming its
    /// output type) use this to avoid picking a concrete `T` to downcast to.
    pub fn depends_on(&self, alias: &BuildAlias) -> Result<()> {
        self.need_any(alias).map(|_| ())
    }

    fn need_any(&self, alias: &BuildAlias) -> Result<Arc<dyn Any + Send + Sync>> {
        let cyclic = BUILD_STACK.with(|stack| stack.borrow().contains(alias));
        if cyclic {
            return Err(Error::dependency(alias.clone(), alias.clone(), "would form a cycle"));
        }

        let slot = self.slot_for(alias);
        let mut guard = slot.lock().unwrap();

        let buildable = self
            .buildables
            .lock()
            .unwrap()
            .get(alias)
            .cloned()
            .ok_or_else(|| Error::configuration(format!("no buildable registered for `{alias}`")))?;

        if let Some(value) = &guard.value {
            if self.is_still_valid(&guard, buildable.as_ref())? {
                return Ok(value.clone());
            }
        }

        BUILD_STACK.with(|stack| stack.borrow_mut().push(alias.clone()));
        let ctx = BuildContext::new(self, alias.clone());
        // Nested `install` calls made from a thread already in this pool run inline rather than
        // re-queuing, so the cycle-detecting thread-local stack above stays valid for the common
        // case of a single external caller driving the whole build from outside the pool.
        let built = self.pool.install(|| buildable.build(&ctx));
        BUILD_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });

        let built = built?; // errors are final for this invocation only: `guard` (the node's
                             // previously committed state, if any) is left untouched below.

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        guard.value = Some(built.clone());
        guard.state_fingerprint = buildable.state_fingerprint();
        guard.static_deps = ctx.take_static_deps();
        guard.file_deps = ctx.take_file_deps();
        guard.dir_deps = ctx.take_dir_deps();
        guard.annotations = ctx.take_annotations();
        guard.built_epoch = epoch;
        for hook in ctx.take_on_built_hooks() {
            hook();
        }

        Ok(built)
    }

    /// Early-cutoff check: a node is reused as-is unless its own declared rules changed, a
    /// declared file/directory input's digest changed, or a recorded static dependency rebuilt
    /// since this node last ran.
    fn is_still_valid(&self, slot: &NodeSlot, buildable: &dyn Buildable) -> Result<bool> {
        if slot.state_fingerprint != buildable.state_fingerprint() {
            return Ok(false);
        }
        for digest in &slot.file_deps {
            let current = self.digests.digest(&digest.path).map_err(|e| Error::io(&digest.path, e))?;
            if current.hash != digest.hash {
                return Ok(false);
            }
        }
        for (path, hash) in &slot.dir_deps {
            let current = self.digests.directory_listing_hash(path).map_err(|e| Error::io(path, e))?;
            if &current != hash {
                return Ok(false);
            }
        }
        for (dep_alias, recorded_epoch) in &slot.static_deps {
            self.need_any(dep_alias)?;
            let dep_slot = self.slot_for(dep_alias);
            let dep_epoch = dep_slot.lock().unwrap().built_epoch;
            if dep_epoch != *recorded_epoch {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn claim_output(&self, owner: &BuildAlias, path: &Path) -> Result<()> {
        let mut claimed = self.claimed_outputs.lock().unwrap();
        match claimed.get(path) {
            Some(existing) if existing != owner => {
                Err(Error::dependency(owner.clone(), existing.clone(), format!("both produce `{}`", path.display())))
            }
            _ => {
                claimed.insert(path.to_path_buf(), owner.clone());
                Ok(())
            }
        }
    }

    pub fn digest_memo(&self) -> &DigestMemo {
        &self.digests
    }

    fn built_epoch_of(&self, alias: &BuildAlias) -> u64 {
        self.slot_for(alias).lock().unwrap().built_epoch
    }
}

/// A cheap, non-cryptographic content hash of any `Debug`-able value. For node kinds whose
/// declarative rules aren't already routed through `cache::fingerprint`'s `Serialize`-based
/// hashing (e.g. the graph wrappers in `unit`/`actions`/`exec`), this is enough to detect "did
/// this node's own recipe change" without requiring every wrapped type to derive `Serialize`.
pub fn debug_fingerprint<T: std::fmt::Debug>(value: &T) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    format!("{value:?}").hash(&mut hasher);
    hasher.finish()
}

/// The per-build-call handle passed to [`Buildable::build`]. Collects declared edges via
/// interior mutability so a `build` implementation may fan dependency resolution out across
/// `rayon::join`/`rayon::scope` without needing `&mut self`.
pub struct BuildContext<'g> {
    graph: &'g Graph,
    alias: BuildAlias,
    static_deps: Mutex<Vec<(BuildAlias, u64)>>,
    file_deps: Mutex<Vec<FileDigest>>,
    dir_deps: Mutex<Vec<(PathBuf, [u8; 32])>>,
    annotations: Mutex<Vec<String>>,
    timestamp: Mutex<Option<std::time::SystemTime>>,
    on_built_hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl<'g> BuildContext<'g> {
    fn new(graph: &'g Graph, alias: BuildAlias) -> Self {
        Self {
            graph,
            alias,
            static_deps: Mutex::new(Vec::new()),
            file_deps: Mutex::new(Vec::new()),
            dir_deps: Mutex::new(Vec::new()),
            annotations: Mutex::new(Vec::new()),
            timestamp: Mutex::new(None),
            on_built_hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn alias(&self) -> &BuildAlias {
        &self.alias
    }

    /// Fetches a dependency's value, recording a static edge to it.
    pub fn need<T: Any + Send + Sync>(&self, alias: &BuildAlias) -> Result<Arc<T>> {
        let value = self.graph.need(alias)?;
        self.static_deps.lock().unwrap().push((alias.clone(), self.graph.built_epoch_of(alias)));
        Ok(value)
    }

    /// Registers `make()`'s buildable if absent, then `need`s it, recording a static edge.
    pub fn need_factory<T: Any + Send + Sync>(&self, alias: &BuildAlias, make: impl FnOnce() -> Arc<dyn Buildable>) -> Result<Arc<T>> {
        let value = self.graph.need_factory(alias, make)?;
        self.static_deps.lock().unwrap().push((alias.clone(), self.graph.built_epoch_of(alias)));
        Ok(value)
    }

    /// Registers `buildable` in the owning graph without building it, so a later `need`/
    /// `need_factory`/`depends_on` call (from this node or another) can resolve it on demand.
    /// Used by nodes that lower into several children up front (e.g. `TargetActionsNode`
    /// registering every `Action` it generates) without forcing them to build eagerly.
    pub fn register(&self, buildable: Arc<dyn Buildable>) {
        self.graph.register(buildable);
    }

    /// Declares a static predecessor edge without needing a typed value back.
    pub fn depends_on(&self, alias: &BuildAlias) -> Result<()> {
        self.graph.depends_on(alias)?;
        self.static_deps.lock().unwrap().push((alias.clone(), self.graph.built_epoch_of(alias)));
        Ok(())
    }

    /// Declares a dynamic file dependency, returning its content digest.
    pub fn need_file(&self, path: &Path) -> Result<FileDigest> {
        let digest = self.graph.digest_memo().digest(path).map_err(|e| Error::io(path, e))?;
        self.file_deps.lock().unwrap().push(digest.clone());
        Ok(digest)
    }

    /// Declares a dynamic directory dependency, returning its listing hash.
    pub fn need_directory(&self, path: &Path) -> Result<[u8; 32]> {
        let hash = self.graph.digest_memo().directory_listing_hash(path).map_err(|e| Error::io(path, e))?;
        self.dir_deps.lock().unwrap().push((path.to_path_buf(), hash));
        Ok(hash)
    }

    /// Declares `path` as an output of this build; fails if another alias already claimed it.
    pub fn output_file(&self, path: &Path) -> Result<()> {
        self.graph.claim_output(&self.alias, path)
    }

    /// Declares every path `make` produces as an output of this build.
    pub fn output_factory(&self, paths: impl IntoIterator<Item = PathBuf>) -> Result<()> {
        for path in paths {
            self.output_file(&path)?;
        }
        Ok(())
    }

    pub fn annotate(&self, message: impl Into<String>) {
        self.annotations.lock().unwrap().push(message.into());
    }

    pub fn timestamp(&self, t: std::time::SystemTime) {
        *self.timestamp.lock().unwrap() = Some(t);
    }

    /// Registers a continuation invoked once this node's new state is committed.
    pub fn on_built(&self, hook: impl FnOnce() + Send + 'static) {
        self.on_built_hooks.lock().unwrap().push(Box::new(hook));
    }

    fn take_static_deps(&self) -> Vec<(BuildAlias, u64)> {
        std::mem::take(&mut self.static_deps.lock().unwrap())
    }

    fn take_file_deps(&self) -> Vec<FileDigest> {
        std::mem::take(&mut self.file_deps.lock().unwrap())
    }

    fn take_dir_deps(&self) -> Vec<(PathBuf, [u8; 32])> {
        std::mem::take(&mut self.dir_deps.lock().unwrap())
    }

    fn take_annotations(&self) -> Vec<String> {
        std::mem::take(&mut self.annotations.lock().unwrap())
    }

    fn take_on_built_hooks(&self) -> Vec<Box<dyn FnOnce() + Send>> {
        std::mem::take(&mut self.on_built_hooks.lock().unwrap())
    }
}
