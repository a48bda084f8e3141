//! Module → Unit lowering: the `expand_module` algorithm and the [`Unit`] it produces.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::alias::BuildAlias;
use crate::error::{Error, Result};
use crate::graph::{debug_fingerprint, BuildContext, Buildable};
use crate::model::{CppRules, Module, ModuleType, PchMode, TagOverride, Visibility};
use crate::registry::Registry;

/// The kind of artifact a [`Unit`] produces, as decided by `payload_of`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Payload {
    Headers,
    ObjectList,
    StaticLib,
    SharedLib,
    Executable,
}

/// Maps `(module_type, link_type)` to the payload it produces. `PROGRAM × DYNAMIC` is rejected
/// outright rather than given a silent default; every other combination is covered.
pub fn payload_of(module_type: ModuleType, link_type: crate::model::LinkType) -> Result<Payload> {
    use crate::model::LinkType::*;
    use ModuleType::*;

    Ok(match (module_type, link_type) {
        (Headers, _) => Payload::Headers,
        (Library, Static | Inherit) => Payload::StaticLib,
        (Library, Dynamic) => Payload::SharedLib,
        (Program, Static | Inherit) => Payload::Executable,
        (Program, Dynamic) => {
            return Err(Error::configuration("PROGRAM modules cannot be linked DYNAMIC"))
        }
        (External, Static | Inherit) => Payload::ObjectList,
        (External, Dynamic) => Payload::SharedLib,
    })
}

/// The compile/link flag bag attached to a module or unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facet {
    pub defines: Vec<String>,
    pub include_dirs: Vec<PathBuf>,
    pub system_include_dirs: Vec<PathBuf>,
    pub force_includes: Vec<PathBuf>,
    pub library_paths: Vec<PathBuf>,
    pub libraries: Vec<String>,
}

impl Facet {
    /// Merges `other`'s public facet into `self`, used to build the transitive facet during
    /// viral dependency closure and propagation to dependents.
    pub fn absorb(&mut self, other: &Facet) {
        prepend_dedup(&mut self.defines, &other.defines);
        prepend_dedup(&mut self.include_dirs, &other.include_dirs);
        prepend_dedup(&mut self.system_include_dirs, &other.system_include_dirs);
        prepend_dedup(&mut self.force_includes, &other.force_includes);
        prepend_dedup(&mut self.library_paths, &other.library_paths);
        prepend_dedup(&mut self.libraries, &other.libraries);
    }

    /// Absorbs only `other`'s include and force-include paths, leaving library paths/names
    /// untouched — a SHAREDLIB consumed at runtime must still compile against its headers
    /// without linking against it.
    pub fn absorb_includes_only(&mut self, other: &Facet) {
        prepend_dedup(&mut self.include_dirs, &other.include_dirs);
        prepend_dedup(&mut self.system_include_dirs, &other.system_include_dirs);
        prepend_dedup(&mut self.force_includes, &other.force_includes);
    }
}

/// Prepends items from `incoming` onto `existing`, skipping any already present — the
/// "deduplicated-prepend" list semantics used for override and facet merging.
fn prepend_dedup<T: PartialEq + Clone>(existing: &mut Vec<T>, incoming: &[T]) {
    let mut prefix: Vec<T> = incoming.iter().filter(|x| !existing.contains(x)).cloned().collect();
    prefix.append(existing);
    *existing = prefix;
}

/// A fully resolved (platform, configuration, compiler) triple a module is lowered against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileEnv {
    pub platform: String,
    pub config: String,
    pub compiler: String,
    /// Tag flags active for this environment; drives per-tag override selection.
    pub tags: BTreeSet<String>,
}

impl CompileEnv {
    pub fn tag(&self) -> String {
        format!("{}-{}", self.platform, self.config)
    }
}

/// How a peer dependency unit is consumed, decided by `classify_dependency`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    Include,
    Compile,
    Link,
    Runtime,
}

/// One resolved dependency edge from a unit to a peer unit.
#[derive(Debug, Clone)]
pub struct ResolvedDependency {
    pub module_name: String,
    pub kind: DependencyKind,
}

/// A Module materialized for a [`CompileEnv`].
#[derive(Debug, Clone)]
pub struct Unit {
    pub module_name: String,
    pub env_tag: String,
    pub payload: Payload,
    pub output_file: PathBuf,
    pub export_file: PathBuf,
    pub extra_files: Vec<PathBuf>,
    pub intermediate_dir: PathBuf,
    pub precompiled_header: Option<PathBuf>,
    pub precompiled_source: Option<PathBuf>,
    pub pch_mode: PchMode,
    pub resolved_compiler: String,
    pub private_deps: Vec<ResolvedDependency>,
    pub public_deps: Vec<ResolvedDependency>,
    pub runtime_deps: Vec<ResolvedDependency>,
    pub facet: Facet,
    pub transitive_facet: Facet,
    pub cpp_rules: CppRules,
    pub source_files: Vec<PathBuf>,
    pub ordinal: u32,
}

/// Minimal view of an already-built peer [`Unit`] needed by `expand_module`, supplied by
/// whatever already resolved it (normally [`GraphDependencyResolver`] in the `build()` path;
/// tests can construct this directly without a graph). Owns its `Unit` rather than borrowing it
/// so a resolver can cache results behind a `RefCell` without fighting the borrow checker.
pub struct PeerUnit {
    pub module_type: ModuleType,
    pub unit: Arc<Unit>,
}

/// A resolver for already-built peer units, keyed by module name. Kept as a trait so
/// `expand_module` stays a pure function testable without a full [`crate::graph::Graph`].
pub trait DependencyResolver {
    fn resolve(&self, module_name: &str) -> Result<PeerUnit>;
}

/// `expand_module`: the core lowering algorithm, steps 1-9.
#[tracing::instrument(skip(module, env, registry, deps), fields(module = %module.name, env = %env.tag()))]
pub fn expand_module(
    module: &Module,
    env: &CompileEnv,
    registry: &Registry,
    deps: &dyn DependencyResolver,
) -> Result<Unit> {
    // Step 1: deep-copy the declarative rules (Rust's ownership means we just clone).
    let mut resolved = module.clone();

    // Step 1b: apply named archetypes, in declaration order, before any per-tag override.
    for name in resolved.archetypes.clone() {
        let archetype = registry
            .archetype(&name)
            .ok_or_else(|| Error::configuration(format!("module `{}` requests unknown archetype `{name}`", resolved.name)))?;
        prepend_dedup(&mut resolved.cpp_rules.defines, &archetype.defines);
        prepend_dedup(&mut resolved.include_dirs, &archetype.include_dirs);
    }

    // Step 2: apply every per-tag override whose tags intersect the environment's tags, in
    // declaration order, using prepend semantics.
    for (_, ov) in resolved.tag.clone().iter().filter(|(_, ov)| {
        ov.tags.iter().any(|t| env.tags.contains(t))
    }) {
        apply_override(&mut resolved, ov);
    }
    if let Some(ov) = resolved.hal.get(&env.platform).cloned() {
        apply_override(&mut resolved, &ov);
    }

    // Step 3: payload table.
    let payload = payload_of(resolved.module_type, resolved.link_type)?;

    // Step 4: resolve PCH, falling back to disabled with a trace if the files aren't valid.
    let (pch_mode, pch_header, pch_source) = resolve_pch(&resolved)?;

    // Steps 5-6: viral dependency closure and per-peer classification.
    let mut private_names: Vec<String> = resolved.private_deps.clone();
    let mut public_names: Vec<String> = resolved.public_deps.clone();
    let mut runtime_names: Vec<String> = resolved.runtime_deps.clone();
    viral_closure(&mut private_names, &mut public_names, &mut runtime_names, deps)?;

    let mut private_deps = Vec::new();
    let mut public_deps = Vec::new();
    let mut runtime_deps = Vec::new();
    let mut transitive_facet = Facet::default();
    let mut max_dep_ordinal = 0i64;

    for (names, bucket, visibility) in [
        (&private_names, &mut private_deps, Visibility::Private),
        (&public_names, &mut public_deps, Visibility::Public),
        (&runtime_names, &mut runtime_deps, Visibility::Runtime),
    ] {
        for name in names {
            let peer = deps.resolve(name)?;
            let kind = classify_dependency(peer.module_type, peer.unit.payload, visibility)?;
            max_dep_ordinal = max_dep_ordinal.max(peer.unit.ordinal as i64);
            match kind {
                DependencyKind::Include | DependencyKind::Compile => {
                    transitive_facet.absorb(&peer.unit.transitive_facet);
                }
                DependencyKind::Runtime => {
                    // SHAREDLIB consumed at runtime: inherit include & force-include paths so
                    // headers resolve, but not the library itself.
                    transitive_facet.absorb_includes_only(&peer.unit.transitive_facet);
                }
                DependencyKind::Link => {}
            }
            bucket.push(ResolvedDependency { module_name: name.clone(), kind });
        }
    }

    // Step 7: ordinal strictly greater than every dependency's ordinal.
    let ordinal = (max_dep_ordinal + 1) as u32;

    // Step 8: synthesized defines + variable substitution.
    let mut facet = Facet {
        defines: resolved.cpp_rules.defines.clone(),
        include_dirs: resolved.include_dirs.clone(),
        system_include_dirs: Vec::new(),
        force_includes: resolved.force_includes.clone(),
        library_paths: Vec::new(),
        libraries: Vec::new(),
    };
    facet.defines.push(format!("BUILD_TARGET_NAME={}", resolved.name));
    facet.defines.push(format!("BUILD_TARGET_ORDINAL={ordinal}"));
    substitute_variables(&mut facet, &resolved.name, &env.tag());

    // Step 9: decorate with platform, config, compiler facets, in that fixed order.
    if let Some(platform) = registry.platform(&env.platform) {
        facet.defines.extend(platform.defines());
    }
    if let Some(config) = registry.config(&env.config) {
        facet.defines.extend(config.flags.defines.clone());
        facet.defines.extend(config.flags.flags.clone());
    }

    transitive_facet.absorb(&facet);

    let intermediate_dir = PathBuf::from("intermediate").join(&env.platform).join(&env.config).join(&resolved.name);
    let ext = registry
        .platform(&env.platform)
        .map(|p| p.compiler().extname(payload).to_string())
        .unwrap_or_else(|| default_extname(payload).to_string());
    let output_file = PathBuf::from("binaries").join(format!("{}-{}{ext}", resolved.name, env.tag()));

    Ok(Unit {
        module_name: resolved.name.clone(),
        env_tag: env.tag(),
        payload,
        output_file: output_file.clone(),
        export_file: output_file,
        extra_files: Vec::new(),
        intermediate_dir,
        precompiled_header: pch_header,
        precompiled_source: pch_source,
        pch_mode,
        resolved_compiler: env.compiler.clone(),
        private_deps,
        public_deps,
        runtime_deps,
        facet,
        transitive_facet,
        cpp_rules: resolved.cpp_rules,
        source_files: resolved.source_files,
        ordinal,
    })
}

/// The full set of declared modules a [`ModuleNode`] may need to resolve a dependency name
/// against, shared across every module lowered against the same environment.
pub type ModuleTable = HashMap<String, Arc<Module>>;

/// Drives `expand_module` through the build graph: lowers a [`Module`] against a [`CompileEnv`]
/// into a [`Unit`], resolving peer dependencies as real static graph edges rather than through a
/// separate out-of-band resolution pass.
pub struct ModuleNode {
    pub module: Arc<Module>,
    pub env: CompileEnv,
    pub registry: Arc<Registry>,
    pub modules: Arc<ModuleTable>,
}

impl Buildable for ModuleNode {
    fn alias(&self) -> BuildAlias {
        BuildAlias::unit(&self.module.name, &self.env.tag())
    }

    fn state_fingerprint(&self) -> u64 {
        debug_fingerprint(&(self.module.as_ref(), &self.env))
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<Arc<dyn Any + Send + Sync>> {
        let resolver = GraphDependencyResolver {
            ctx,
            modules: self.modules.clone(),
            env: self.env.clone(),
            registry: self.registry.clone(),
            cache: RefCell::new(HashMap::new()),
        };
        let unit = expand_module(&self.module, &self.env, &self.registry, &resolver)?;
        Ok(Arc::new(unit))
    }
}

/// Resolves dependency names to already-built peer [`Unit`]s by routing through the graph:
/// resolving a name for the first time registers (if absent) and builds that peer module's own
/// [`ModuleNode`], so the dependency becomes a real static edge the graph can invalidate through.
struct GraphDependencyResolver<'g, 'c> {
    ctx: &'c BuildContext<'g>,
    modules: Arc<ModuleTable>,
    env: CompileEnv,
    registry: Arc<Registry>,
    cache: RefCell<HashMap<String, (ModuleType, Arc<Unit>)>>,
}

impl<'g, 'c> DependencyResolver for GraphDependencyResolver<'g, 'c> {
    fn resolve(&self, module_name: &str) -> Result<PeerUnit> {
        if let Some((module_type, unit)) = self.cache.borrow().get(module_name) {
            return Ok(PeerUnit { module_type: *module_type, unit: unit.clone() });
        }

        let module = self
            .modules
            .get(module_name)
            .cloned()
            .ok_or_else(|| Error::configuration(format!("no such module `{module_name}`")))?;
        let module_type = module.module_type;
        let alias = BuildAlias::unit(module_name, &self.env.tag());
        let env = self.env.clone();
        let registry = self.registry.clone();
        let modules = self.modules.clone();

        let unit: Arc<Unit> = self
            .ctx
            .need_factory(&alias, move || Arc::new(ModuleNode { module, env, registry, modules }))?;
        self.cache.borrow_mut().insert(module_name.to_string(), (module_type, unit.clone()));
        Ok(PeerUnit { module_type, unit })
    }
}

fn default_extname(payload: Payload) -> &'static str {
    match payload {
        Payload::Headers => "",
        Payload::ObjectList => ".o",
        Payload::StaticLib => ".a",
        Payload::SharedLib => ".so",
        Payload::Executable => "",
    }
}

fn apply_override(module: &mut Module, ov: &TagOverride) {
    prepend_dedup(&mut module.cpp_rules.defines, &ov.defines);
    prepend_dedup(&mut module.include_dirs, &ov.include_dirs);
    prepend_dedup(&mut module.private_deps, &ov.private_deps);
    prepend_dedup(&mut module.public_deps, &ov.public_deps);
    prepend_dedup(&mut module.runtime_deps, &ov.runtime_deps);
    if let Some(lt) = ov.link_type {
        module.link_type = lt;
    }
}

fn resolve_pch(module: &Module) -> Result<(PchMode, Option<PathBuf>, Option<PathBuf>)> {
    match module.pch_mode {
        PchMode::Disabled => Ok((PchMode::Disabled, None, None)),
        PchMode::Shared => {
            // Shared PCHs across configs would need a cross-config compatibility check
            // this crate has no algorithm for; reject rather than guess.
            Err(Error::configuration(format!(
                "module `{}` requests pch = shared, which is not supported",
                module.name
            )))
        }
        mode @ (PchMode::Monolithic | PchMode::HeaderUnit) => {
            match (&module.precompiled_header, &module.precompiled_source) {
                (Some(h), Some(s)) => Ok((mode, Some(h.clone()), Some(s.clone()))),
                _ => {
                    tracing::trace!(module = %module.name, "pch requested but header/source incomplete, disabling");
                    Ok((PchMode::Disabled, None, None))
                }
            }
        }
    }
}

/// Step 5: recursively pull the public deps of every private dep into the private set; public
/// deps of public deps into public; runtime deps transitively into runtime across all sets.
fn viral_closure(
    private: &mut Vec<String>,
    public: &mut Vec<String>,
    runtime: &mut Vec<String>,
    deps: &dyn DependencyResolver,
) -> Result<()> {
    let mut seen_private: HashSet<String> = private.iter().cloned().collect();
    let mut seen_public: HashSet<String> = public.iter().cloned().collect();
    let mut seen_runtime: HashSet<String> = runtime.iter().cloned().collect();

    let mut frontier_private: Vec<String> = private.clone();
    while let Some(name) = frontier_private.pop() {
        let peer = deps.resolve(&name)?;
        for pub_dep in &peer.unit.public_deps {
            if seen_private.insert(pub_dep.module_name.clone()) {
                private.push(pub_dep.module_name.clone());
                frontier_private.push(pub_dep.module_name.clone());
            }
        }
    }

    let mut frontier_public: Vec<String> = public.clone();
    while let Some(name) = frontier_public.pop() {
        let peer = deps.resolve(&name)?;
        for pub_dep in &peer.unit.public_deps {
            if seen_public.insert(pub_dep.module_name.clone()) {
                public.push(pub_dep.module_name.clone());
                frontier_public.push(pub_dep.module_name.clone());
            }
        }
    }

    let mut frontier_runtime: Vec<String> = runtime.clone();
    frontier_runtime.extend(private.iter().cloned());
    frontier_runtime.extend(public.iter().cloned());
    while let Some(name) = frontier_runtime.pop() {
        let peer = deps.resolve(&name)?;
        for rt_dep in &peer.unit.runtime_deps {
            if seen_runtime.insert(rt_dep.module_name.clone()) {
                runtime.push(rt_dep.module_name.clone());
                frontier_runtime.push(rt_dep.module_name.clone());
            }
        }
    }

    Ok(())
}

/// Step 6: classify a peer dependency by its payload, the peer's module type, and the
/// declared visibility.
fn classify_dependency(peer_module_type: ModuleType, peer_payload: Payload, visibility: Visibility) -> Result<DependencyKind> {
    use Payload::*;

    match peer_payload {
        Executable => Err(Error::configuration("cannot depend on an EXECUTABLE module")),
        Headers => Ok(DependencyKind::Include),
        ObjectList => Ok(DependencyKind::Compile),
        StaticLib | SharedLib if visibility == Visibility::Runtime && peer_payload == SharedLib => {
            Ok(DependencyKind::Runtime)
        }
        StaticLib | SharedLib => {
            if peer_module_type == ModuleType::Library {
                Ok(DependencyKind::Link)
            } else {
                Ok(DependencyKind::Compile)
            }
        }
    }
}

/// `{{.name}}`-style variable substitution, performed after synthesized defines are appended.
/// Applies to every facet field: module-declared `include_dirs`/`force_includes` can equally
/// carry template placeholders, not just `defines`.
fn substitute_variables(facet: &mut Facet, module_name: &str, env_tag: &str) {
    let subst = |s: &str| s.replace("{{.name}}", module_name).replace("{{.env}}", env_tag);
    let subst_path = |p: &PathBuf| PathBuf::from(subst(&p.to_string_lossy()));

    facet.defines = facet.defines.iter().map(|s| subst(s)).collect();
    facet.include_dirs = facet.include_dirs.iter().map(subst_path).collect();
    facet.system_include_dirs = facet.system_include_dirs.iter().map(subst_path).collect();
    facet.force_includes = facet.force_includes.iter().map(subst_path).collect();
    facet.library_paths = facet.library_paths.iter().map(subst_path).collect();
    facet.libraries = facet.libraries.iter().map(|s| subst(s)).collect();
}
