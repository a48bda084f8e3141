//! `compile_commands.json` writer: bit-exact with the well-known compile-commands
//! database format, one record per object-list action, with unity files expanded to one record
//! per member source.

use std::path::{Path, PathBuf};

use path_slash::PathExt as _;
use serde::Serialize;

use crate::actions::{Action, PayloadKind, TargetActions};
use crate::error::{Error, Result};
use crate::unity::UnityPlan;

/// One `compile_commands.json` record. Paths are written with forward slashes regardless of
/// host platform, matching the well-known compile-commands format's convention.
#[derive(Debug, Clone, Serialize)]
pub struct CompileCommand {
    #[serde(serialize_with = "serialize_slash")]
    pub directory: PathBuf,
    #[serde(serialize_with = "serialize_slash")]
    pub file: PathBuf,
    #[serde(serialize_with = "serialize_slash")]
    pub output: PathBuf,
    pub arguments: Vec<String>,
}

fn serialize_slash<S: serde::Serializer>(path: &PathBuf, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&path.to_slash_lossy())
}

/// Builds the full set of records for one unit's object-list actions, expanding any unity file
/// input into one record per member source file it actually compiles (`includes`, not
/// `excluded` — those compile as their own separate, non-unity object-list action and already
/// get their own record).
pub fn build_records(actions: &[Action], unity_plan: &UnityPlan) -> Vec<CompileCommand> {
    let mut records = Vec::new();
    for action in actions {
        let Some(input) = action.static_inputs.first() else { continue };
        if let Some(unity_file) = unity_plan.unity_files.iter().find(|u| &u.output_path == input) {
            for member in &unity_file.includes {
                records.push(CompileCommand {
                    directory: action.working_dir.clone(),
                    file: member.clone(),
                    output: action.outputs.first().cloned().unwrap_or_default(),
                    arguments: action.args.clone(),
                });
            }
        } else {
            records.push(CompileCommand {
                directory: action.working_dir.clone(),
                file: input.clone(),
                output: action.outputs.first().cloned().unwrap_or_default(),
                arguments: action.args.clone(),
            });
        }
    }
    records
}

/// Collects every object-list action across a [`TargetActions`] DAG, resolving aliases back to
/// their [`Action`]s via `resolve`.
pub fn object_list_actions<'a>(target: &TargetActions, resolve: &dyn Fn(&crate::alias::BuildAlias) -> Option<&'a Action>) -> Vec<&'a Action> {
    target
        .payloads
        .iter()
        .filter(|p| p.kind == Some(PayloadKind::ObjectList))
        .flat_map(|p| p.action_aliases.iter())
        .filter_map(|alias| resolve(alias))
        .collect()
}

/// Writes `records` as `<intermediate>/<platform>/<config>/compile_commands.json` under
/// `intermediate_root`.
pub fn write_compile_commands(intermediate_root: &Path, platform: &str, config: &str, records: &[CompileCommand]) -> Result<PathBuf> {
    let dir = intermediate_root.join(platform).join(config);
    std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
    let path = dir.join("compile_commands.json");
    let bytes = serde_json::to_vec_pretty(records).map_err(crate::error::CacheError::from)?;
    std::fs::write(&path, bytes).map_err(|e| Error::io(&path, e))?;
    Ok(path)
}
