//! Unity-build compositor: batches source files into synthesized translation units.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::contracts::ScmProbe;

/// How many unity files a module wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnityMode {
    /// `N = ceil(total_remaining_size / size_per_unity)`.
    Automatic,
    /// A fixed cluster count.
    Explicit(usize),
    Disabled,
}

/// The two clustering strategies the compositor can batch members by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterStrategy {
    #[default]
    ByModificationTime,
    BestFitBySize,
}

/// Metadata about one candidate source file, as seen by the compositor. Reading this off disk
/// is the caller's responsibility (the graph's `FileDigest`/mtime machinery).
#[derive(Debug, Clone)]
pub struct SourceFileMeta {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: SystemTime,
}

/// A synthesized translation unit.
#[derive(Debug, Clone)]
pub struct UnityFile {
    pub output_path: PathBuf,
    /// Inputs actually compiled as part of this unity file (not excluded).
    pub includes: Vec<PathBuf>,
    /// Inputs present as text (so the unity file still depends on them) but compiled
    /// separately — either because the SCM probe reports them modified (adaptive unity) or
    /// because the caller excluded them up front.
    pub excluded: Vec<PathBuf>,
    /// Maximum mtime of `includes ∪ excluded`.
    pub mtime: SystemTime,
}

impl UnityFile {
    /// All sources this unity file depends on as text, compiled or not.
    pub fn all_inputs(&self) -> impl Iterator<Item = &PathBuf> {
        self.includes.iter().chain(self.excluded.iter())
    }

    /// Renders the synthesized `.cpp` content.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for path in &self.includes {
            out.push_str(&format!("#pragma message(\"unity: {}\")\n", path.display()));
            out.push_str(&format!("#include \"{}\"\n", path.display()));
        }
        for path in &self.excluded {
            out.push_str(&format!(
                "/* excluded from unity, compiled separately: #include \"{}\" */\n",
                path.display()
            ));
        }
        out
    }
}

/// Result of composing a module's source list into unity files.
#[derive(Debug, Clone, Default)]
pub struct UnityPlan {
    pub unity_files: Vec<UnityFile>,
    /// Sources larger than `size_per_unity`, never clustered.
    pub isolated: Vec<PathBuf>,
    /// Sources excluded from whichever cluster would have owned them (adaptive unity).
    pub adaptive: Vec<PathBuf>,
}

impl UnityPlan {
    /// Every source file this plan accounts for, each exactly once.
    pub fn object_list_inputs(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for uf in &self.unity_files {
            out.push(uf.output_path.clone());
        }
        out.extend(self.isolated.iter().cloned());
        out.extend(self.adaptive.iter().cloned());
        out
    }
}

/// Composes `sources` into a [`UnityPlan`], batching by the configured cluster strategy and
/// pulling any SCM-modified or explicitly-excluded sources out into isolated compiles.
#[tracing::instrument(skip(sources, scm), fields(n = sources.len()))]
pub fn compose(
    sources: &[SourceFileMeta],
    size_per_unity: u64,
    mode: UnityMode,
    strategy: ClusterStrategy,
    scm: &dyn ScmProbe,
    unity_dir: &Path,
) -> UnityPlan {
    // Step 1: isolate oversized files.
    let (oversized, mut remaining): (Vec<_>, Vec<_>) =
        sources.iter().cloned().partition(|f| f.size > size_per_unity);

    if remaining.is_empty() {
        return UnityPlan { unity_files: vec![], isolated: oversized, adaptive: vec![] };
    }

    // Step 2: determine cluster count N.
    let total: u64 = remaining.iter().map(|f| f.size).sum();
    let n = match mode {
        UnityMode::Disabled => remaining.len(),
        UnityMode::Explicit(n) => n.max(1),
        UnityMode::Automatic => {
            let n = total.div_ceil(size_per_unity.max(1)) as usize;
            n.max(1)
        }
    };
    if mode != UnityMode::Disabled && n >= remaining.len() {
        tracing::warn!(n, sources = remaining.len(), "unity cluster count >= source count, disabling unity");
        return UnityPlan { unity_files: vec![], isolated: oversized, adaptive: remaining };
    }

    // Step 3: partition into N clusters.
    let mut clusters: Vec<Vec<SourceFileMeta>> = match strategy {
        ClusterStrategy::ByModificationTime => {
            remaining.sort_by_key(|f| f.mtime);
            partition_by_mtime(remaining, n, size_per_unity)
        }
        ClusterStrategy::BestFitBySize => {
            remaining.sort_by(|a, b| b.size.cmp(&a.size));
            partition_best_fit(remaining, n)
        }
    };
    clusters.retain(|c| !c.is_empty());

    // Steps 4-5: synthesize unity files, applying adaptive exclusion.
    let mut unity_files = Vec::new();
    let mut adaptive = Vec::new();
    for (i, cluster) in clusters.iter().enumerate() {
        let mut includes = Vec::new();
        let mut excluded = Vec::new();
        let mut max_mtime = cluster.first().map(|f| f.mtime).unwrap_or(SystemTime::UNIX_EPOCH);
        for file in cluster {
            max_mtime = max_mtime.max(file.mtime);
            if scm.has_unversioned_modifications(&file.path) {
                excluded.push(file.path.clone());
                adaptive.push(file.path.clone());
            } else {
                includes.push(file.path.clone());
            }
        }
        let output_path = unity_dir.join(format!("Unity_{}_of_{}.cpp", i + 1, clusters.len()));
        unity_files.push(UnityFile { output_path, includes, excluded, mtime: max_mtime });
    }

    UnityPlan { unity_files, isolated: oversized, adaptive }
}

fn partition_by_mtime(sorted: Vec<SourceFileMeta>, n: usize, size_per_unity: u64) -> Vec<Vec<SourceFileMeta>> {
    let total = sorted.len();
    let per_cluster_count = total.div_ceil(n);
    let size_budget = size_per_unity.max(1);

    let mut clusters: Vec<Vec<SourceFileMeta>> = vec![Vec::new(); n];
    let mut idx = 0;
    for file in sorted {
        let cluster = &mut clusters[idx.min(n - 1)];
        let cluster_size: u64 = cluster.iter().map(|f| f.size).sum();
        if idx < n - 1 && (cluster_size + file.size > size_budget || cluster.len() >= per_cluster_count) && !cluster.is_empty()
        {
            idx += 1;
            clusters[idx].push(file);
        } else {
            cluster.push(file);
        }
    }
    clusters
}

fn partition_best_fit(sorted_desc: Vec<SourceFileMeta>, n: usize) -> Vec<Vec<SourceFileMeta>> {
    let mut clusters: Vec<Vec<SourceFileMeta>> = vec![Vec::new(); n];
    let mut sizes = vec![0u64; n];
    for file in sorted_desc {
        let (smallest, _) = sizes.iter().enumerate().min_by_key(|&(_, s)| *s).unwrap();
        sizes[smallest] += file.size;
        clusters[smallest].push(file);
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::NullScmProbe;
    use std::time::Duration;

    fn file(name: &str, size: u64, age_secs: u64) -> SourceFileMeta {
        SourceFileMeta {
            path: PathBuf::from(name),
            size,
            mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 - age_secs),
        }
    }

    #[test]
    fn isolates_oversized_and_clusters_the_rest() {
        let sources = vec![
            file("a.cpp", 1024, 3),
            file("b.cpp", 1024, 2),
            file("c.cpp", 150 * 1024, 1),
        ];
        let plan = compose(
            &sources,
            100 * 1024,
            UnityMode::Automatic,
            ClusterStrategy::ByModificationTime,
            &NullScmProbe,
            Path::new("unity"),
        );
        assert_eq!(plan.isolated, vec![PathBuf::from("c.cpp")]);
        assert_eq!(plan.unity_files.len(), 1);
        assert_eq!(plan.unity_files[0].includes, vec![PathBuf::from("a.cpp"), PathBuf::from("b.cpp")]);
        assert_eq!(plan.object_list_inputs().len(), 2);
    }

    #[test]
    fn adaptive_unity_excludes_modified_file() {
        struct ModifiedA;
        impl ScmProbe for ModifiedA {
            fn has_unversioned_modifications(&self, path: &Path) -> bool {
                path == Path::new("a.cpp")
            }
            fn foreach_local_modification(&self, _cb: &mut dyn FnMut(&Path)) {}
        }

        let sources = vec![
            file("a.cpp", 1024, 3),
            file("b.cpp", 1024, 2),
            file("c.cpp", 150 * 1024, 1),
        ];
        let plan = compose(
            &sources,
            100 * 1024,
            UnityMode::Automatic,
            ClusterStrategy::ByModificationTime,
            &ModifiedA,
            Path::new("unity"),
        );
        assert_eq!(plan.unity_files[0].excluded, vec![PathBuf::from("a.cpp")]);
        assert_eq!(plan.unity_files[0].includes, vec![PathBuf::from("b.cpp")]);
        assert_eq!(plan.adaptive, vec![PathBuf::from("a.cpp")]);
    }

    #[test]
    fn no_source_is_compiled_twice() {
        let sources: Vec<_> = (0..9).map(|i| file(&format!("f{i}.cpp"), 1000, i)).collect();
        let plan = compose(&sources, 3000, UnityMode::Automatic, ClusterStrategy::ByModificationTime, &NullScmProbe, Path::new("u"));
        let mut compiled: Vec<String> = plan
            .unity_files
            .iter()
            .flat_map(|u| u.includes.iter())
            .chain(plan.isolated.iter())
            .chain(plan.adaptive.iter())
            .map(|p| p.display().to_string())
            .collect();
        compiled.sort();
        compiled.dedup();
        let expected: Vec<String> = (0..9).map(|i| format!("f{i}.cpp")).collect();
        assert_eq!(compiled.len(), expected.len());
    }

    #[test]
    fn too_many_clusters_disables_unity() {
        let sources = vec![file("a.cpp", 10, 1), file("b.cpp", 10, 2)];
        let plan = compose(&sources, 100, UnityMode::Explicit(5), ClusterStrategy::ByModificationTime, &NullScmProbe, Path::new("u"));
        assert!(plan.unity_files.is_empty());
        assert_eq!(plan.adaptive.len(), 2);
    }
}
