//! Workspace resolution for activity attribution.
//!
//! Maps an absolute file path to the logical workspace it belongs to. The
//! strategies run in priority order and the first one that produces a root
//! wins:
//!
//! 1. The outermost version-control root within `MAX_VCS_DEPTH` ancestors, so
//!    nested repositories inside a monorepo share the monorepo's identity.
//! 2. The nearest project manifest that sits no deeper than
//!    `MAX_MARKER_DEPTH` path components, skipping vendored subtrees.
//! 3. The child of a well-known projects folder (`~/projects/<name>`).
//! 4. A fixed-depth prefix of the path.
//!
//! Identity is derived from the root path, so the same root always yields the
//! same id. Results are memoized per input path.

use companion_daemon_protocol::WorkspaceInfo;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

pub const MAX_VCS_DEPTH: usize = 15;

/// Deepest path (in components) at which a project manifest is trusted.
pub const MAX_MARKER_DEPTH: usize = 8;

const FALLBACK_PREFIX_DEPTH: usize = 4;

pub const VCS_MARKERS: &[&str] = &[".git", ".hg", ".svn"];

pub const PROJECT_MARKERS: &[&str] = &[
    "package.json",
    "Cargo.toml",
    "pyproject.toml",
    "setup.py",
    "go.mod",
    "pom.xml",
    "build.gradle",
    "build.gradle.kts",
    "Gemfile",
    "composer.json",
    "pubspec.yaml",
    "deno.json",
    "CMakeLists.txt",
];

/// Directory names whose children are usually individual projects.
pub const KNOWN_PARENT_DIRS: &[&str] = &[
    "projects",
    "Projects",
    "code",
    "Code",
    "dev",
    "Development",
    "src",
    "repos",
    "workspace",
    "workspaces",
    "Documents",
    "Desktop",
];

/// Generated or vendored directories; manifests inside them are not roots.
pub const IGNORED_DIRECTORIES: &[&str] = &[
    "node_modules",
    "vendor",
    "__pycache__",
    "target",
    "dist",
    "build",
    ".next",
    "venv",
    ".venv",
    ".cache",
    "site-packages",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionMethod {
    VcsRoot,
    ProjectMarker,
    KnownParent,
    PathPrefix,
}

impl ResolutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionMethod::VcsRoot => "vcs_root",
            ResolutionMethod::ProjectMarker => "project_marker",
            ResolutionMethod::KnownParent => "known_parent",
            ResolutionMethod::PathPrefix => "path_prefix",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub id: String,
    pub root_path: PathBuf,
    pub method: ResolutionMethod,
}

impl Workspace {
    pub fn info(&self) -> WorkspaceInfo {
        WorkspaceInfo {
            id: self.id.clone(),
            root_path: path_to_string(&self.root_path),
            method: self.method.as_str().to_string(),
        }
    }
}

#[derive(Debug)]
pub struct WorkspaceResolver {
    known: BTreeMap<String, Workspace>,
    resolved: HashMap<PathBuf, String>,
    home_dir: Option<PathBuf>,
    max_marker_depth: usize,
}

impl Default for WorkspaceResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceResolver {
    pub fn new() -> Self {
        Self::with_home(dirs::home_dir())
    }

    fn with_home(home_dir: Option<PathBuf>) -> Self {
        Self {
            known: BTreeMap::new(),
            resolved: HashMap::new(),
            home_dir,
            max_marker_depth: MAX_MARKER_DEPTH,
        }
    }

    #[cfg(test)]
    fn with_marker_depth(mut self, depth: usize) -> Self {
        self.max_marker_depth = depth;
        self
    }

    pub fn resolve(&mut self, path: &Path) -> Workspace {
        if let Some(workspace) = self
            .resolved
            .get(path)
            .and_then(|id| self.known.get(id))
        {
            return workspace.clone();
        }

        let (root, method) = self.locate_root(path);
        let root = canonicalize_path(&root);
        let workspace = Workspace {
            id: workspace_id(&root),
            root_path: root,
            method,
        };

        if !self.known.contains_key(&workspace.id) {
            tracing::debug!(
                workspace_id = %workspace.id,
                root = %workspace.root_path.display(),
                method = workspace.method.as_str(),
                "Workspace discovered"
            );
        }
        self.known
            .entry(workspace.id.clone())
            .or_insert_with(|| workspace.clone());
        self.resolved.insert(path.to_path_buf(), workspace.id.clone());
        workspace
    }

    pub fn known_workspaces(&self) -> Vec<WorkspaceInfo> {
        self.known.values().map(Workspace::info).collect()
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    fn locate_root(&self, path: &Path) -> (PathBuf, ResolutionMethod) {
        if let Some(root) = self.find_outermost_vcs_root(path) {
            return (root, ResolutionMethod::VcsRoot);
        }
        if let Some(root) = self.find_project_marker(path) {
            return (root, ResolutionMethod::ProjectMarker);
        }
        if let Some(root) = find_known_parent_child(path) {
            return (root, ResolutionMethod::KnownParent);
        }
        (path_prefix(path), ResolutionMethod::PathPrefix)
    }

    fn find_outermost_vcs_root(&self, path: &Path) -> Option<PathBuf> {
        let mut outermost = None;
        for dir in self.ancestors(path).take(MAX_VCS_DEPTH) {
            if VCS_MARKERS.iter().any(|marker| dir.join(marker).exists()) {
                outermost = Some(dir.to_path_buf());
            }
        }
        outermost
    }

    fn find_project_marker(&self, path: &Path) -> Option<PathBuf> {
        let mut candidate: Option<PathBuf> = None;
        for dir in self.ancestors(path).take(MAX_VCS_DEPTH) {
            if let Some(name) = dir.file_name().and_then(|name| name.to_str()) {
                if IGNORED_DIRECTORIES.contains(&name) {
                    // Anything found so far was inside the vendored subtree.
                    candidate = None;
                    continue;
                }
            }

            if candidate.is_none()
                && path_depth(dir) <= self.max_marker_depth
                && PROJECT_MARKERS.iter().any(|marker| dir.join(marker).is_file())
            {
                candidate = Some(dir.to_path_buf());
            }
        }
        candidate
    }

    /// Ancestor directories of `path`, nearest first, stopping before the home
    /// directory and the filesystem root.
    fn ancestors<'a>(&'a self, path: &'a Path) -> impl Iterator<Item = &'a Path> + 'a {
        let start = if path.is_dir() { Some(path) } else { path.parent() };
        start
            .into_iter()
            .flat_map(Path::ancestors)
            .take_while(move |dir| {
                dir.parent().is_some() && self.home_dir.as_deref() != Some(*dir)
            })
    }
}

fn find_known_parent_child(path: &Path) -> Option<PathBuf> {
    let components: Vec<Component<'_>> = path.components().collect();
    // The child beneath the known parent must be a directory, not the file itself.
    let last_dir_index = if path.is_dir() {
        components.len()
    } else {
        components.len().saturating_sub(1)
    };

    let parent_index = components.iter().position(|component| match component {
        Component::Normal(name) => name
            .to_str()
            .map(|name| KNOWN_PARENT_DIRS.contains(&name))
            .unwrap_or(false),
        _ => false,
    })?;

    if parent_index + 1 >= last_dir_index {
        return None;
    }
    Some(components[..=parent_index + 1].iter().collect())
}

fn path_prefix(path: &Path) -> PathBuf {
    let components: Vec<Component<'_>> = path.components().collect();
    let normal_count = components
        .iter()
        .filter(|component| matches!(component, Component::Normal(_)))
        .count();

    if normal_count <= FALLBACK_PREFIX_DEPTH {
        return path.parent().unwrap_or(path).to_path_buf();
    }

    let mut prefix = PathBuf::new();
    let mut taken = 0;
    for component in components {
        if matches!(component, Component::Normal(_)) {
            if taken == FALLBACK_PREFIX_DEPTH {
                break;
            }
            taken += 1;
        }
        prefix.push(component.as_os_str());
    }
    prefix
}

fn path_depth(path: &Path) -> usize {
    path.components()
        .filter(|component| matches!(component, Component::Normal(_)))
        .count()
}

pub fn workspace_id(root: &Path) -> String {
    let source = path_to_string(root);
    #[cfg(target_os = "macos")]
    let source = source.to_lowercase();
    format!("{:x}", md5::compute(source))
}

fn canonicalize_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
