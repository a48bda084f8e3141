//! Plug-in contracts the engine consumes.
//!
//! Concrete compiler back ends, cluster transports and source-control probes are out of scope
//! for this crate; it only defines the traits they must satisfy, plus minimal no-op
//! implementations (`Null*`) so the engine can run stand-alone in tests.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use crate::actions::Action;
use crate::error::Result;
use crate::unit::{Payload, Unit};

/// Tri-state permission used for response files and edit-and-continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
    #[default]
    Inherit,
    Allowed,
    Unavailable,
}

/// `CacheMode` CLI flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Inherit,
    None,
    Read,
    ReadWrite,
}

impl CacheMode {
    pub fn can_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Self::ReadWrite)
    }

    /// Resolves an `Inherit` mode against a parent default; non-`Inherit` modes pass through.
    pub fn resolve(self, parent: CacheMode) -> CacheMode {
        if self == Self::Inherit {
            parent
        } else {
            self
        }
    }
}

/// `DistMode` CLI flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistMode {
    #[default]
    Inherit,
    None,
    Enable,
    Force,
}

impl DistMode {
    pub fn resolve(self, parent: DistMode) -> DistMode {
        if self == Self::Inherit {
            parent
        } else {
            self
        }
    }

    pub fn wants_remote(self) -> bool {
        matches!(self, Self::Enable | Self::Force)
    }

    pub fn is_forced(self) -> bool {
        matches!(self, Self::Force)
    }
}

/// A compiler back end. Concrete implementations (MSVC/Clang/GCC) are out of scope; this trait
/// is the seam the generator and execution engine call through.
pub trait Compiler: Send + Sync {
    /// File extension produced for a given payload kind (e.g. `.o`, `.a`, `.exe`).
    fn extname(&self, payload: Payload) -> &str;

    /// Renders one compile/link flag family into command-line arguments.
    fn define_flags(&self, defines: &[String]) -> Vec<String>;
    fn include_flags(&self, include_dirs: &[PathBuf]) -> Vec<String>;
    fn library_flags(&self, libraries: &[String]) -> Vec<String>;
    fn force_include_flags(&self, headers: &[PathBuf]) -> Vec<String>;
    fn system_include_flags(&self, include_dirs: &[PathBuf]) -> Vec<String>;
    fn library_path_flags(&self, paths: &[PathBuf]) -> Vec<String>;

    /// Rewrites an action so that the compiler itself emits a dependency manifest, used when
    /// the host platform has no OS-level file-access interception available.
    fn source_dependencies(&self, action: Action) -> Result<Action>;

    fn allow_caching(&self, unit: &Unit, payload: Payload) -> Permission;
    fn allow_distribution(&self, unit: &Unit, payload: Payload) -> Permission;
    fn allow_response_file(&self, unit: &Unit, payload: Payload) -> Permission;
    fn allow_edit_and_continue(&self, unit: &Unit, payload: Payload) -> Permission;
}

/// A target platform: supplies the compiler to use and platform-wide defines.
pub trait Platform: Send + Sync {
    fn name(&self) -> &str;
    fn arch(&self) -> &str;
    fn defines(&self) -> Vec<String>;
    fn compiler(&self) -> &dyn Compiler;

    /// Whether this platform supports OS-level file-access interception for dependency
    /// discovery. When `false`, the generator falls back to
    /// `Compiler::source_dependencies`.
    fn supports_file_access_tracing(&self) -> bool {
        false
    }
}

/// Source-control awareness used for adaptive unity and cache exclusion.
pub trait ScmProbe: Send + Sync {
    fn has_unversioned_modifications(&self, path: &Path) -> bool;
    fn foreach_local_modification(&self, callback: &mut dyn FnMut(&Path));
}

/// A no-op probe: nothing is ever reported as modified. Suitable for engine tests and for
/// deployments with no SCM integration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullScmProbe;

impl ScmProbe for NullScmProbe {
    fn has_unversioned_modifications(&self, _path: &Path) -> bool {
        false
    }

    fn foreach_local_modification(&self, _callback: &mut dyn FnMut(&Path)) {}
}

/// Outcome of attempting to hand an action off to a remote worker.
pub enum DispatchOutcome {
    /// The dispatcher accepted the action and ran it; carries the peer identifier it executed
    /// on, for annotation.
    Ran { peer: String, status: ExitStatus },
    /// The dispatcher declined (queue full, no compatible peer, etc); the caller should fall
    /// back to local execution.
    NotDispatched,
}

/// The cluster dispatch contract. Wire-level protocol is explicitly out of scope.
pub trait WorkerDispatcher: Send + Sync {
    /// Whether remote dispatch should even be attempted; `force` mirrors `DistMode::Force`.
    fn can_distribute(&self, force: bool) -> bool;

    fn dispatch(&self, exe: &Path, args: &[String], cwd: &Path) -> Result<DispatchOutcome>;
}

/// A dispatcher that never accepts work; all actions run locally. Used when no cluster back end
/// is configured and as the default in tests exercising the remote-dispatch fallback path.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWorkerDispatcher;

impl WorkerDispatcher for NullWorkerDispatcher {
    fn can_distribute(&self, _force: bool) -> bool {
        false
    }

    fn dispatch(&self, _exe: &Path, _args: &[String], _cwd: &Path) -> Result<DispatchOutcome> {
        Ok(DispatchOutcome::NotDispatched)
    }
}

/// Record of one file a subprocess touched, surfaced to the generator's file-access tracing
/// path.
pub struct FileAccess {
    pub path: PathBuf,
    pub write: bool,
}

/// Runs one external command. `file_access_hook`, when the platform supports tracing, is
/// invoked once per file the process opened.
pub trait ProcessRunner: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn run(
        &self,
        exe: &Path,
        args: &[String],
        env: &[(String, String)],
        cwd: &Path,
        use_response_file: bool,
        file_access_hook: Option<&mut dyn FnMut(FileAccess)>,
    ) -> Result<ExitStatus>;
}

/// A [`ProcessRunner`] that spawns real child processes via `std::process::Command`, with no
/// file-access tracing (platforms that want tracing must supply their own runner).
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessRunner;

impl ProcessRunner for InProcessRunner {
    fn run(
        &self,
        exe: &Path,
        args: &[String],
        env: &[(String, String)],
        cwd: &Path,
        use_response_file: bool,
        _file_access_hook: Option<&mut dyn FnMut(FileAccess)>,
    ) -> Result<ExitStatus> {
        use std::io::Write;
        use std::process::Command;

        let mut cmd = Command::new(exe);
        cmd.current_dir(cwd);
        cmd.envs(env.iter().cloned());

        let _respfile_guard;
        if use_response_file {
            let mut file = tempfile_respfile()?;
            for arg in args {
                writeln!(file.as_file_mut(), "{arg}").map_err(|e| crate::error::Error::io(cwd, e))?;
            }
            cmd.arg(format!("@{}", file.path().display()));
            _respfile_guard = Some(file);
        } else {
            cmd.args(args);
            _respfile_guard = None;
        }

        cmd.status().map_err(|e| crate::error::Error::io(exe, e))
    }
}

/// Minimal response-file helper; real response-file naming/cleanup policy belongs to the
/// execution engine (kept here only so `InProcessRunner` is self-contained).
struct NamedTempRespfile {
    file: std::fs::File,
    path: PathBuf,
}

impl NamedTempRespfile {
    fn as_file_mut(&mut self) -> &mut std::fs::File {
        &mut self.file
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

fn tempfile_respfile() -> Result<NamedTempRespfile> {
    let path = std::env::temp_dir().join(format!("ubuild-resp-{}.rsp", std::process::id()));
    let file = std::fs::File::create(&path).map_err(|e| crate::error::Error::io(&path, e))?;
    Ok(NamedTempRespfile { file, path })
}
