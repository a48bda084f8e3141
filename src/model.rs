//! The declarative module/namespace model, as loaded from JSON. Loading the JSON off
//! disk and resolving globs against the filesystem is out of scope for this crate (treated the
//! same way the original project treats `solc` discovery: a concern of the caller); this module
//! only defines the shapes and the pure transformation (`expand_module`, in [`crate::unit`])
//! that consumes them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What kind of build output a module ultimately produces, before payload lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModuleType {
    Headers,
    Library,
    Program,
    External,
}

impl Default for ModuleType {
    fn default() -> Self {
        Self::Headers
    }
}

/// How a [`ModuleType::Library`]-ish module should be linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkType {
    Static,
    Dynamic,
    Inherit,
}

/// Dependency visibility, as declared in the module model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Public,
    Runtime,
}

/// How a module wants its precompiled header handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PchMode {
    #[default]
    Disabled,
    Monolithic,
    HeaderUnit,
    /// Commented-out in the original design; explicitly unsupported.
    Shared,
}

/// C++-specific compile rules nested inside a module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CppRules {
    #[serde(default)]
    pub std: Option<String>,
    #[serde(default)]
    pub rtti: Option<bool>,
    #[serde(default)]
    pub exceptions: Option<bool>,
    #[serde(default)]
    pub defines: Vec<String>,
}

/// A per-tag override applied during `expand_module` step 2. Scalar fields use "later wins";
/// list fields are deduplicated-prepended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagOverride {
    pub tags: Vec<String>,
    #[serde(default)]
    pub defines: Vec<String>,
    #[serde(default)]
    pub include_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub private_deps: Vec<String>,
    #[serde(default)]
    pub public_deps: Vec<String>,
    #[serde(default)]
    pub runtime_deps: Vec<String>,
    #[serde(default)]
    pub link_type: Option<LinkType>,
}

/// A named, reusable decorator applied to a module's rules before per-tag overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archetype {
    pub name: String,
    #[serde(default)]
    pub defines: Vec<String>,
    #[serde(default)]
    pub include_dirs: Vec<PathBuf>,
}

/// Rules for a source module, deduced from one JSON model file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub module_type: ModuleType,
    #[serde(default)]
    pub link_type: LinkType,
    #[serde(default)]
    pub source_globs: Vec<String>,
    #[serde(default)]
    pub source_files: Vec<PathBuf>,
    #[serde(default)]
    pub excluded_globs: Vec<String>,
    #[serde(default)]
    pub excluded_files: Vec<PathBuf>,
    #[serde(default)]
    pub include_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub private_deps: Vec<String>,
    #[serde(default)]
    pub public_deps: Vec<String>,
    #[serde(default)]
    pub runtime_deps: Vec<String>,
    #[serde(default)]
    pub cpp_rules: CppRules,
    #[serde(default)]
    pub pch_mode: PchMode,
    #[serde(default)]
    pub precompiled_header: Option<PathBuf>,
    #[serde(default)]
    pub precompiled_source: Option<PathBuf>,
    #[serde(default)]
    pub force_includes: Vec<PathBuf>,
    #[serde(default)]
    pub archetypes: Vec<String>,
    #[serde(default)]
    pub allowed_platforms: Vec<String>,
    /// Host-keyed override map.
    #[serde(default)]
    pub hal: BTreeMap<String, TagOverride>,
    /// Tag-flag-keyed override map.
    #[serde(default)]
    pub tag: BTreeMap<String, TagOverride>,
}

impl Default for LinkType {
    fn default() -> Self {
        Self::Inherit
    }
}

/// A tree node grouping child namespaces and modules, with an inheritable extension model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    #[serde(default)]
    pub children: Vec<Namespace>,
    #[serde(default)]
    pub modules: Vec<Module>,
    #[serde(default)]
    pub allowed_platforms: Vec<String>,
    #[serde(default)]
    pub archetypes: Vec<String>,
}

impl Namespace {
    /// Depth-first iteration over every module reachable from this namespace.
    pub fn modules(&self) -> Vec<&Module> {
        let mut out: Vec<&Module> = self.modules.iter().collect();
        for child in &self.children {
            out.extend(child.modules());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_deserializes_from_minimal_json() {
        let json = r#"{"name": "Foo", "module_type": "LIBRARY"}"#;
        let module: Module = serde_json::from_str(json).unwrap();
        assert_eq!(module.name, "Foo");
        assert_eq!(module.module_type, ModuleType::Library);
        assert_eq!(module.link_type, LinkType::Inherit);
        assert!(module.source_files.is_empty());
    }

    #[test]
    fn namespace_flattens_nested_modules() {
        let ns = Namespace {
            name: "root".into(),
            children: vec![Namespace {
                name: "child".into(),
                modules: vec![Module { name: "Bar".into(), module_type: ModuleType::Headers, ..Default::default() }],
                ..Default::default()
            }],
            modules: vec![Module { name: "Foo".into(), module_type: ModuleType::Library, ..Default::default() }],
            ..Default::default()
        };
        let names: Vec<_> = ns.modules().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["Foo", "Bar"]);
    }
}
