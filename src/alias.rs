//! Stable node identities.

use std::fmt;

/// A typed, string-like identity of a graph node.
///
/// Two aliases are equal iff their `(kind, components)` are equal; the `kind` prefix keeps
/// aliases from different subsystems (a `Module` and a `Unit` derived from it, say) from
/// colliding even if their path components happen to match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildAlias {
    kind: AliasKind,
    components: Vec<String>,
}

/// The typed prefix of a [`BuildAlias`]. New kinds are added as new `Buildable` variants are
/// introduced; this list matches the entities of the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AliasKind {
    Namespace,
    Module,
    Unit,
    TargetActions,
    TargetPayload,
    Action,
    UnityFile,
    Directory,
    FileDigest,
    CompileEnv,
    CompilerRules,
    Platform,
    Config,
    Generated,
}

impl AliasKind {
    fn tag(self) -> &'static str {
        match self {
            Self::Namespace => "namespace",
            Self::Module => "module",
            Self::Unit => "unit",
            Self::TargetActions => "target-actions",
            Self::TargetPayload => "target-payload",
            Self::Action => "action",
            Self::UnityFile => "unity-file",
            Self::Directory => "directory",
            Self::FileDigest => "file-digest",
            Self::CompileEnv => "compile-env",
            Self::CompilerRules => "compiler-rules",
            Self::Platform => "platform",
            Self::Config => "config",
            Self::Generated => "generated",
        }
    }
}

impl BuildAlias {
    pub fn new(kind: AliasKind, components: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { kind, components: components.into_iter().map(Into::into).collect() }
    }

    /// Builds a [`BuildAlias::Unit`] alias from a module name and environment tag, the most
    /// common composite alias in the system (`Module@x64-Devel`).
    pub fn unit(module: &str, env_tag: &str) -> Self {
        Self::new(AliasKind::Unit, [module, env_tag])
    }

    pub fn module(name: &str) -> Self {
        Self::new(AliasKind::Module, [name])
    }

    pub fn action(owner_unit: &str, payload: &str, discriminant: &str) -> Self {
        Self::new(AliasKind::Action, [owner_unit, payload, discriminant])
    }

    pub fn kind(&self) -> AliasKind {
        self.kind
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }
}

impl fmt::Display for BuildAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.tag(), self.components.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_roundtrips_components() {
        let a = BuildAlias::unit("Foo", "x64-Devel");
        assert_eq!(a.to_string(), "unit:Foo/x64-Devel");
    }

    #[test]
    fn distinct_kinds_do_not_collide() {
        let module = BuildAlias::module("Foo");
        let unit = BuildAlias::new(AliasKind::Unit, ["Foo"]);
        assert_ne!(module, unit);
    }
}
