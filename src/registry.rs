//! Global build configuration and shared maps, recast as an explicitly-passed struct. Nothing
//! here is a `static`/`lazy_static`; a [`Registry`] is built once by the (out-of-scope) CLI
//! layer and threaded through every [`crate::graph::BuildContext`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::contracts::{CacheMode, DistMode, Permission, Platform};
use crate::model::Archetype;

/// A named, reusable set of compiler flags (`AllCompilationFlags` in the design notes).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilationFlagSet {
    pub defines: Vec<String>,
    pub flags: Vec<String>,
}

/// One build configuration (`Devel`, `Release`, ...); a named bag of compilation flags plus
/// whether it optimizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub name: String,
    pub flags: CompilationFlagSet,
    pub optimized: bool,
}

/// The set of known platforms, configurations, archetypes and flag presets, built once at
/// startup and passed by reference through build contexts. Replaces the mutable globals
/// (`AllPlatforms`, `AllConfigurations`, `AllArchetypes`, `AllCompilationFlags`) that a naive
/// port of the source design would otherwise carry.
#[derive(Default)]
pub struct Registry {
    platforms: HashMap<String, Arc<dyn Platform>>,
    configs: HashMap<String, Config>,
    archetypes: HashMap<String, Archetype>,
    flag_sets: HashMap<String, CompilationFlagSet>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_platform(&mut self, platform: Arc<dyn Platform>) {
        self.platforms.insert(platform.name().to_string(), platform);
    }

    pub fn register_config(&mut self, config: Config) {
        self.configs.insert(config.name.clone(), config);
    }

    pub fn register_archetype(&mut self, archetype: Archetype) {
        self.archetypes.insert(archetype.name.clone(), archetype);
    }

    pub fn register_flag_set(&mut self, name: impl Into<String>, flags: CompilationFlagSet) {
        self.flag_sets.insert(name.into(), flags);
    }

    pub fn platform(&self, name: &str) -> Option<&Arc<dyn Platform>> {
        self.platforms.get(name)
    }

    pub fn config(&self, name: &str) -> Option<&Config> {
        self.configs.get(name)
    }

    pub fn archetype(&self, name: &str) -> Option<&Archetype> {
        self.archetypes.get(name)
    }

    pub fn flag_set(&self, name: &str) -> Option<&CompilationFlagSet> {
        self.flag_sets.get(name)
    }

    pub fn platform_names(&self) -> impl Iterator<Item = &str> {
        self.platforms.keys().map(String::as_str)
    }

    pub fn config_names(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }
}

/// The CLI-facing build options, modeled as plain data; parsing flags into this struct is out of
/// scope (treated the same way the source tree treats its own `ProjectPathsConfig` builder
/// input: a struct the binary constructs, not something this crate parses argv into).
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub cache_mode: CacheMode,
    pub cache_path: PathBuf,
    pub dist_mode: DistMode,
    pub response_file: Permission,
    pub show_cmds: bool,
    pub show_files: bool,
    pub show_output: bool,
    /// Mixed into every action's fingerprint; defaults to zero, changing it invalidates the
    /// whole cache.
    pub cache_seed: u64,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            cache_mode: CacheMode::ReadWrite,
            cache_path: PathBuf::from(".ubuild-cache"),
            dist_mode: DistMode::None,
            response_file: Permission::Inherit,
            show_cmds: false,
            show_files: false,
            show_output: false,
            cache_seed: 0,
        }
    }
}
