//! Target → Action generation: lowers a [`Unit`] into a DAG of [`Action`]s grouped by
//! [`PayloadKind`], including `%1`/`%2`/`%3` command-line substitution.

use std::any::Any;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::alias::{AliasKind, BuildAlias};
use crate::contracts::{CacheMode, Compiler, DistMode, Permission};
use crate::error::{Error, Result};
use crate::exec::{ActionNode, ExecutionEngine};
use crate::graph::{debug_fingerprint, BuildContext, Buildable};
use crate::unit::{DependencyKind, PchMode, Unit};
use crate::unity::UnityPlan;

/// The kind of artifact a single [`Action`] produces. A superset of [`crate::unit::Payload`]:
/// PCH and header-unit actions exist only inside a unit's action DAG, never as a unit-level
/// payload in their own right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PayloadKind {
    Pch,
    HeaderUnit,
    Headers,
    ObjectList,
    StaticLib,
    SharedLib,
    Executable,
}

/// An externally executable command.
#[derive(Debug, Clone)]
pub struct Action {
    pub alias: BuildAlias,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub static_inputs: Vec<PathBuf>,
    pub dynamic_inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub exports: Vec<PathBuf>,
    pub extras: Vec<PathBuf>,
    /// Prerequisite action aliases: linked against (happens-before) but, beyond the hash of
    /// their own cache key, not content-addressed inputs themselves.
    pub prerequisites: Vec<BuildAlias>,
    pub cache_mode: CacheMode,
    pub dist_mode: DistMode,
    pub response_file: Permission,
    pub edit_and_continue: Permission,
    pub allow_relative_paths: bool,
}

impl Action {
    /// Every declared input, in the fixed order rules are serialized (static before dynamic) so
    /// the same action always fingerprints the same way.
    pub fn declared_inputs(&self) -> impl Iterator<Item = &PathBuf> {
        self.static_inputs.iter().chain(self.dynamic_inputs.iter())
    }

    /// Applies the edit-and-continue lower-casing workaround:
    /// when the compiler requires case-insensitive output names, outputs/exports/extras are
    /// lower-cased. The behavior is preserved verbatim; a warning is emitted rather than
    /// attempting a "correct" fix.
    pub fn apply_edit_and_continue_workaround(&mut self) {
        if self.edit_and_continue == Permission::Allowed {
            tracing::warn!(alias = %self.alias, "lower-casing outputs for edit-and-continue compatibility");
            for list in [&mut self.outputs, &mut self.exports, &mut self.extras] {
                for path in list.iter_mut() {
                    *path = PathBuf::from(path.to_string_lossy().to_lowercase());
                }
            }
        }
    }

    /// No two actions may claim the same output path; call against the set of
    /// outputs already claimed by sibling actions.
    pub fn check_output_uniqueness(&self, claimed: &mut BTreeSet<PathBuf>) -> Result<()> {
        for out in self.outputs.iter().chain(self.exports.iter()).chain(self.extras.iter()) {
            if !claimed.insert(out.clone()) {
                return Err(Error::configuration(format!("output `{}` claimed by more than one action", out.display())));
            }
        }
        Ok(())
    }
}

/// One payload's action set within a [`TargetActions`] DAG.
#[derive(Debug, Clone, Default)]
pub struct TargetPayload {
    pub kind: Option<PayloadKind>,
    pub action_aliases: Vec<BuildAlias>,
}

/// The full action DAG for a [`Unit`].
#[derive(Debug, Clone, Default)]
pub struct TargetActions {
    pub payloads: Vec<TargetPayload>,
    /// Every action generated, in generation order — the flat counterpart to `payloads`'
    /// alias-only bookkeeping, kept so a caller (e.g. [`TargetActionsNode`]) can register each
    /// one with the build graph without re-deriving it from aliases.
    pub actions: Vec<Action>,
}

/// Per-dependency exports/includes needed while generating actions, computed once from a
/// lowered unit's resolved dependency lists.
struct DependencyInputs {
    compile_dep_includes: Vec<PathBuf>,
    link_dep_exports: Vec<PathBuf>,
    runtime_dep_names: Vec<String>,
}

fn split_dependency_inputs(unit: &Unit, dep_exports: &dyn Fn(&str) -> PathBuf) -> DependencyInputs {
    let mut compile_dep_includes = Vec::new();
    let mut link_dep_exports = Vec::new();
    let mut runtime_dep_names = Vec::new();

    for dep in unit.private_deps.iter().chain(unit.public_deps.iter()) {
        match dep.kind {
            DependencyKind::Include | DependencyKind::Compile => {
                compile_dep_includes.push(dep_exports(&dep.module_name));
            }
            DependencyKind::Link => link_dep_exports.push(dep_exports(&dep.module_name)),
            DependencyKind::Runtime => runtime_dep_names.push(dep.module_name.clone()),
        }
    }
    for dep in &unit.runtime_deps {
        runtime_dep_names.push(dep.module_name.clone());
    }

    DependencyInputs { compile_dep_includes, link_dep_exports, runtime_dep_names }
}

/// Generates the full [`TargetActions`] DAG for a lowered unit, after the unity compositor has
/// rewritten its source set.
///
/// `dep_exports` resolves a dependency module name to the export file of its already-built
/// unit; `command_template` supplies the payload-specific `%1`/`%2`/`%3` template for each
/// [`PayloadKind`] this generator may need (PCH, header-unit, object-list, static-lib,
/// shared-lib/executable), mirroring the shape of the `Compiler` plug-in contract.
#[tracing::instrument(skip_all, fields(module = %unit.module_name, env = %unit.env_tag))]
pub fn generate_target_actions(
    unit: &Unit,
    unity_plan: &UnityPlan,
    dep_exports: &dyn Fn(&str) -> PathBuf,
    command_template: &dyn Fn(PayloadKind) -> Vec<String>,
    supports_file_access_tracing: bool,
) -> Result<TargetActions> {
    let mut payloads = Vec::new();
    let mut actions = Vec::new();
    let mut claimed_outputs = BTreeSet::new();
    let deps = split_dependency_inputs(unit, dep_exports);

    // PCH / header-unit.
    let mut pch_alias = None;
    if unit.pch_mode == PchMode::Shared {
        return Err(Error::configuration("pch = shared is not supported"));
    }
    if matches!(unit.pch_mode, PchMode::Monolithic | PchMode::HeaderUnit) {
        if let (Some(header), Some(source)) = (&unit.precompiled_header, &unit.precompiled_source) {
            let kind = if unit.pch_mode == PchMode::HeaderUnit { PayloadKind::HeaderUnit } else { PayloadKind::Pch };
            let alias = BuildAlias::action(&unit.module_name, "pch", "0");
            let pch_out = unit.intermediate_dir.join("pch.pch");
            let pch_obj = unit.intermediate_dir.join("pch.o");
            let mut action = Action {
                alias: alias.clone(),
                executable: PathBuf::from(&unit.resolved_compiler),
                args: substitute_args(&command_template(kind), &[source.clone()], &pch_out, Some(&pch_obj)),
                working_dir: unit.intermediate_dir.clone(),
                env: vec![],
                static_inputs: vec![header.clone(), source.clone()],
                dynamic_inputs: vec![],
                outputs: vec![pch_out],
                exports: vec![pch_obj],
                extras: vec![],
                prerequisites: vec![],
                cache_mode: CacheMode::ReadWrite,
                dist_mode: DistMode::None,
                response_file: Permission::Inherit,
                edit_and_continue: Permission::Inherit,
                allow_relative_paths: false,
            };
            action.apply_edit_and_continue_workaround();
            action.check_output_uniqueness(&mut claimed_outputs)?;
            pch_alias = Some(alias.clone());
            actions.push(action);
            payloads.push(TargetPayload { kind: Some(kind), action_aliases: vec![alias] });
        }
    }

    // Object-list: one action per post-unity source.
    let mut object_aliases = Vec::new();
    let mut object_outputs = Vec::new();
    for (i, input) in unity_plan.object_list_inputs().into_iter().enumerate() {
        let alias = BuildAlias::action(&unit.module_name, "objlist", &i.to_string());
        let output = unit.intermediate_dir.join(object_file_name(&input));
        object_outputs.push(output.clone());
        let mut dynamic_inputs = Vec::new();
        if !supports_file_access_tracing {
            dynamic_inputs.extend(deps.compile_dep_includes.clone());
        }
        let mut action = Action {
            alias: alias.clone(),
            executable: PathBuf::from(&unit.resolved_compiler),
            args: substitute_args(&command_template(PayloadKind::ObjectList), &[input.clone()], &output, None),
            working_dir: unit.intermediate_dir.clone(),
            env: vec![],
            static_inputs: vec![input],
            dynamic_inputs,
            outputs: vec![output],
            exports: vec![],
            extras: vec![],
            prerequisites: pch_alias.clone().into_iter().collect(),
            cache_mode: CacheMode::ReadWrite,
            dist_mode: DistMode::Inherit,
            response_file: Permission::Inherit,
            edit_and_continue: Permission::Inherit,
            allow_relative_paths: false,
        };
        action.apply_edit_and_continue_workaround();
        action.check_output_uniqueness(&mut claimed_outputs)?;
        object_aliases.push(alias.clone());
        actions.push(action);
        payloads.push(TargetPayload { kind: Some(PayloadKind::ObjectList), action_aliases: vec![alias] });
    }

    // Static-lib / shared-lib / executable: one link action for the unit's own payload.
    use crate::unit::Payload::*;
    match unit.payload {
        Headers => {
            // Always emitted, even when empty.
            payloads.push(TargetPayload { kind: Some(PayloadKind::Headers), action_aliases: vec![] });
        }
        ObjectList => {
            // The object-list actions above already constitute this unit's payload; no
            // additional link step.
        }
        StaticLib | SharedLib | Executable => {
            if unit.payload == Executable && !deps.link_dep_exports.is_empty() {
                // Executables may link dependency libraries; nothing here rejects it. Rejecting
                // an executable used as a dependency itself happens upstream in
                // `classify_dependency`, not here.
            }
            let kind = match unit.payload {
                StaticLib => PayloadKind::StaticLib,
                SharedLib => PayloadKind::SharedLib,
                Executable => PayloadKind::Executable,
                _ => unreachable!(),
            };
            let alias = BuildAlias::action(&unit.module_name, "link", "0");
            let mut dynamic_inputs: Vec<PathBuf> = object_outputs.clone();
            dynamic_inputs.extend(deps.compile_dep_includes.clone());
            if kind != PayloadKind::StaticLib {
                dynamic_inputs.extend(deps.link_dep_exports.clone());
            }
            let mut prerequisites: Vec<BuildAlias> = pch_alias.clone().into_iter().collect();
            prerequisites.extend(object_aliases.clone());

            let mut action = Action {
                alias: alias.clone(),
                executable: PathBuf::from(&unit.resolved_compiler),
                args: substitute_args(&command_template(kind), &dynamic_inputs, &unit.output_file, None),
                working_dir: unit.intermediate_dir.clone(),
                env: vec![],
                static_inputs: vec![],
                dynamic_inputs,
                outputs: vec![unit.output_file.clone()],
                exports: vec![unit.export_file.clone()],
                extras: vec![],
                prerequisites,
                cache_mode: CacheMode::ReadWrite,
                dist_mode: DistMode::None,
                response_file: Permission::Inherit,
                edit_and_continue: Permission::Inherit,
                allow_relative_paths: false,
            };
            action.apply_edit_and_continue_workaround();
            action.check_output_uniqueness(&mut claimed_outputs)?;
            // Runtime deps become static graph edges only, never action inputs.
            let _runtime_edges = &deps.runtime_dep_names;
            actions.push(action);
            payloads.push(TargetPayload { kind: Some(kind), action_aliases: vec![alias] });
        }
    }

    Ok(TargetActions { payloads, actions })
}

/// Resolves a dependency module name to its already-built peer [`Unit`]'s export file via the
/// graph, rather than out-of-band bookkeeping. The peer's `Unit` node is expected to already be
/// registered — the owning unit's own [`crate::unit::ModuleNode`] build registers every
/// dependency it resolves before this node ever runs. Degrades to an empty path with a logged
/// warning rather than failing the whole action DAG over one unresolved export.
fn dep_export_via_graph(ctx: &BuildContext<'_>, module_name: &str, env_tag: &str) -> PathBuf {
    match ctx.need::<Unit>(&BuildAlias::unit(module_name, env_tag)) {
        Ok(unit) => unit.export_file.clone(),
        Err(err) => {
            tracing::warn!(module = module_name, %err, "failed to resolve dependency export path via graph");
            PathBuf::new()
        }
    }
}

/// Drives [`generate_target_actions`] through the build graph: lowers an already-built [`Unit`]
/// into its [`TargetActions`] DAG, then registers every generated [`Action`] as its own
/// [`crate::exec::ActionNode`] so a later `need`/`depends_on` can resolve and run it on demand.
pub struct TargetActionsNode {
    pub unit_alias: BuildAlias,
    pub env_tag: String,
    pub unity_plan: UnityPlan,
    pub command_template: Arc<dyn Fn(PayloadKind) -> Vec<String> + Send + Sync>,
    pub engine: Arc<ExecutionEngine>,
    pub compiler: Arc<dyn Compiler>,
    pub dest_root: PathBuf,
    pub supports_file_access_tracing: bool,
}

impl Buildable for TargetActionsNode {
    fn alias(&self) -> BuildAlias {
        BuildAlias::new(AliasKind::TargetActions, [self.unit_alias.components()[0].clone(), self.env_tag.clone()])
    }

    fn state_fingerprint(&self) -> u64 {
        debug_fingerprint(&(&self.unit_alias, &self.env_tag, &self.unity_plan, self.supports_file_access_tracing))
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<Arc<dyn Any + Send + Sync>> {
        let unit: Arc<Unit> = ctx.need(&self.unit_alias)?;
        let env_tag = self.env_tag.clone();
        let dep_exports = move |name: &str| dep_export_via_graph(ctx, name, &env_tag);
        let target_actions =
            generate_target_actions(&unit, &self.unity_plan, &dep_exports, self.command_template.as_ref(), self.supports_file_access_tracing)?;

        for action in &target_actions.actions {
            ctx.register(Arc::new(ActionNode {
                action: action.clone(),
                engine: self.engine.clone(),
                compiler: self.compiler.clone(),
                dest_root: self.dest_root.clone(),
                supports_file_access_tracing: self.supports_file_access_tracing,
            }));
        }

        Ok(Arc::new(target_actions))
    }
}

fn object_file_name(source: &std::path::Path) -> String {
    let stem = source.file_stem().and_then(|s| s.to_str()).unwrap_or("out");
    format!("{stem}.o")
}

/// `%1`/`%2`/`%3` command-line substitution: `%1` is the input (replicated per input if
/// the template accepts multiple), `%2` the output, `%3` the accompanying object for PCH /
/// header-unit payloads.
pub fn substitute_args(template: &[String], inputs: &[PathBuf], output: &std::path::Path, accompanying: Option<&std::path::Path>) -> Vec<String> {
    let mut out = Vec::new();
    for arg in template {
        if arg.contains("%1") {
            if inputs.len() > 1 {
                for input in inputs {
                    out.push(arg.replace("%1", &input.to_string_lossy()));
                }
            } else if let Some(input) = inputs.first() {
                out.push(arg.replace("%1", &input.to_string_lossy()));
            } else {
                out.push(arg.clone());
            }
        } else if arg.contains("%2") {
            out.push(arg.replace("%2", &output.to_string_lossy()));
        } else if arg.contains("%3") {
            let accompanying = accompanying.map(|p| p.to_string_lossy().to_string()).unwrap_or_default();
            out.push(arg.replace("%3", &accompanying));
        } else {
            out.push(arg.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent1_replicates_for_multiple_inputs() {
        let template = vec!["-c".to_string(), "%1".to_string(), "-o".to_string(), "%2".to_string()];
        let inputs = vec![PathBuf::from("a.cpp"), PathBuf::from("b.cpp")];
        let args = substitute_args(&template, &inputs, std::path::Path::new("out.o"), None);
        assert_eq!(args, vec!["-c", "a.cpp", "b.cpp", "-o", "out.o"]);
    }

    #[test]
    fn percent1_consumes_single_input_once() {
        let template = vec!["%1".to_string()];
        let inputs = vec![PathBuf::from("a.cpp")];
        let args = substitute_args(&template, &inputs, std::path::Path::new("out.o"), None);
        assert_eq!(args, vec!["a.cpp"]);
    }

    #[test]
    fn pch_template_uses_percent3_for_accompanying_object() {
        let template = vec!["/Yc".to_string(), "%2".to_string(), "/Fo".to_string(), "%3".to_string()];
        let args = substitute_args(&template, &[PathBuf::from("pch.cpp")], std::path::Path::new("pch.pch"), Some(std::path::Path::new("pch.o")));
        assert_eq!(args, vec!["/Yc", "pch.pch", "/Fo", "pch.o"]);
    }

    #[test]
    fn output_uniqueness_is_enforced() {
        let mut claimed = BTreeSet::new();
        let action = |out: &str| Action {
            alias: BuildAlias::action("Foo", "objlist", "0"),
            executable: PathBuf::new(),
            args: vec![],
            working_dir: PathBuf::new(),
            env: vec![],
            static_inputs: vec![],
            dynamic_inputs: vec![],
            outputs: vec![PathBuf::from(out)],
            exports: vec![],
            extras: vec![],
            prerequisites: vec![],
            cache_mode: CacheMode::ReadWrite,
            dist_mode: DistMode::None,
            response_file: Permission::Inherit,
            edit_and_continue: Permission::Inherit,
            allow_relative_paths: false,
        };
        action("a.o").check_output_uniqueness(&mut claimed).unwrap();
        assert!(action("a.o").check_output_uniqueness(&mut claimed).is_err());
    }
}
