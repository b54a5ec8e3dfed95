//! Project and workspace detection.
//!
//! A depth-bounded scan finds every directory holding a language's root
//! marker. Monorepo manifests (Cargo `[workspace]`, tsconfig `references`,
//! `go.work`) then fold their members into the workspace root so that only
//! roots are served. Scan results are cached for a short TTL.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;

use crate::config::ScanConfig;
use crate::registry::{ServerRegistry, WorkspaceKind};
use crate::types::ProjectRoot;

/// Directory names never descended into.
pub const DEFAULT_IGNORE_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    "dist",
    "build",
    "out",
    "__pycache__",
    ".venv",
    "venv",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    "vendor",
    ".next",
    ".cache",
    "coverage",
];

/// Build directories probed for a compilation database.
pub const BUILD_DIRS: &[&str] = &[
    "build",
    "out",
    "cmake-build-debug",
    "cmake-build-release",
    "builddir",
    "_build",
    "Debug",
    "Release",
];

const COMPILE_COMMANDS: &str = "compile_commands.json";

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Directories up to this many levels below the root are searched.
    pub max_depth: usize,
    pub ignore_dirs: HashSet<String>,
    pub cache_ttl: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::from_scan(&ScanConfig::default())
    }
}

impl DetectorConfig {
    /// Built-in ignore set extended with the configured names.
    #[must_use]
    pub fn from_scan(scan: &ScanConfig) -> Self {
        let ignore_dirs = DEFAULT_IGNORE_DIRS
            .iter()
            .map(|s| (*s).to_string())
            .chain(scan.ignore.iter().cloned())
            .collect();
        Self {
            max_depth: scan.max_depth,
            ignore_dirs,
            cache_ttl: scan.cache_ttl(),
        }
    }
}

#[derive(Debug, Clone)]
struct LanguageMarkers {
    language_id: String,
    markers: Vec<String>,
    extensions: Vec<String>,
    workspace: WorkspaceKind,
}

struct CachedScan {
    at: Instant,
    projects: Arc<Vec<ProjectRoot>>,
}

/// Finds projects under one workspace root.
pub struct WorkspaceDetector {
    root: PathBuf,
    config: DetectorConfig,
    languages: Vec<LanguageMarkers>,
    cache: Mutex<Option<CachedScan>>,
}

impl WorkspaceDetector {
    #[must_use]
    pub fn new(root: &Path, config: DetectorConfig, registry: &ServerRegistry) -> Self {
        let languages = registry
            .iter()
            .map(|d| LanguageMarkers {
                language_id: d.language_id.clone(),
                markers: d.root_markers.clone(),
                extensions: d.file_extensions.clone(),
                workspace: d.workspace,
            })
            .collect();
        Self {
            root: normalize_path(root),
            config,
            languages,
            cache: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All projects under the root, workspace members folded into their
    /// roots. Cached for the configured TTL.
    pub fn scan(&self) -> Arc<Vec<ProjectRoot>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = cache.as_ref()
            && cached.at.elapsed() < self.config.cache_ttl
        {
            return cached.projects.clone();
        }

        let started = Instant::now();
        let projects = Arc::new(self.scan_uncached());
        tracing::debug!(
            root = %self.root.display(),
            count = projects.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "Workspace scan complete"
        );
        *cache = Some(CachedScan {
            at: Instant::now(),
            projects: projects.clone(),
        });
        projects
    }

    /// Drop cached scan results (after files were created or removed).
    pub fn invalidate(&self) {
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn scan_uncached(&self) -> Vec<ProjectRoot> {
        let mut found: HashMap<(PathBuf, usize), (usize, String)> = HashMap::new();
        let mut record = |dir: PathBuf, lang: usize, priority: usize, marker: String| {
            let entry = found.entry((dir, lang)).or_insert((priority, marker.clone()));
            if priority < entry.0 {
                *entry = (priority, marker);
            }
        };

        for path in self.walk_files() {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(dir) = path.parent() else {
                continue;
            };
            for (lang, markers) in self.languages.iter().enumerate() {
                let Some(priority) = markers.markers.iter().position(|m| m == name) else {
                    continue;
                };
                let (dir, marker) = attribute_build_dir(dir, name);
                record(dir, lang, priority, marker);
            }
        }

        // `build` and `out` are ignored by the walk; probe them directly.
        for (lang, markers) in self.languages.iter().enumerate() {
            if let Some(priority) = markers.markers.iter().position(|m| m == COMPILE_COMMANDS)
                && let Some(marker) = probe_build_dirs(&self.root)
            {
                record(self.root.clone(), lang, priority, marker);
            }
        }

        let mut projects: Vec<ProjectRoot> = found
            .into_iter()
            .map(|((dir, lang), (_, marker))| self.make_project(&dir, &self.languages[lang], marker))
            .collect();

        let workspaces: Vec<(String, WorkspaceInfo)> = projects
            .iter()
            .filter(|p| p.is_workspace_root())
            .filter_map(|p| {
                let lang = self.language(p.language_id())?;
                let info = workspace_info(lang.workspace, p.path(), p.marker())?;
                Some((p.language_id().to_string(), info))
            })
            .collect();

        projects.retain(|p| {
            !workspaces
                .iter()
                .any(|(lang, ws)| lang == p.language_id() && ws.owns(p.path()))
        });
        projects.sort_by(|a, b| {
            a.path()
                .cmp(b.path())
                .then_with(|| a.language_id().cmp(b.language_id()))
        });
        projects
    }

    fn walk_files(&self) -> Vec<PathBuf> {
        let ignore_dirs = self.config.ignore_dirs.clone();
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .standard_filters(false)
            .follow_links(false)
            .max_depth(Some(self.config.max_depth + 1))
            .filter_entry(move |entry| {
                if entry.depth() == 0 || !entry.file_type().is_some_and(|t| t.is_dir()) {
                    return true;
                }
                entry
                    .file_name()
                    .to_str()
                    .is_none_or(|name| !ignore_dirs.contains(name))
            });

        let mut files = Vec::new();
        for entry in builder.build() {
            match entry {
                Ok(entry) if entry.file_type().is_some_and(|t| t.is_file()) => {
                    files.push(entry.into_path());
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("Skipping unreadable entry during scan: {e}"),
            }
        }
        files
    }

    /// The nearest project containing `file`, walking up to the root.
    ///
    /// Within one directory the file's own language wins; other languages'
    /// markers are the fallback. `None` when nothing is found inside the root.
    #[must_use]
    pub fn find_owner(&self, file: &Path) -> Option<ProjectRoot> {
        let file = self.absolutize(file);
        if !file.starts_with(&self.root) {
            return None;
        }
        let own = self.language_for_file(&file);
        let start = if file.is_dir() {
            file.as_path()
        } else {
            file.parent()?
        };

        for dir in start.ancestors() {
            if !dir.starts_with(&self.root) {
                break;
            }
            if let Some(lang) = own
                && let Some(project) = self.project_at(dir, lang)
            {
                return Some(project);
            }
            for lang in &self.languages {
                if own.is_some_and(|o| o.language_id == lang.language_id) {
                    continue;
                }
                if let Some(project) = self.project_at(dir, lang) {
                    return Some(project);
                }
            }
        }
        None
    }

    /// [`find_owner`](Self::find_owner), promoted to the enclosing workspace
    /// root of the same language when the owner is one of its members.
    #[must_use]
    pub fn resolve(&self, file: &Path) -> Option<ProjectRoot> {
        let owner = self.find_owner(file)?;
        if owner.is_workspace_root() {
            return Some(owner);
        }
        let Some(lang) = self.language(owner.language_id()) else {
            return Some(owner);
        };
        if lang.workspace == WorkspaceKind::None {
            return Some(owner);
        }

        for dir in owner.path().ancestors().skip(1) {
            if !dir.starts_with(&self.root) {
                break;
            }
            let Some(candidate) = self.project_at(dir, lang) else {
                continue;
            };
            if let Some(info) = workspace_info(lang.workspace, dir, candidate.marker())
                && info.owns(owner.path())
            {
                return Some(candidate);
            }
        }

        // Members declared outside the root's subtree, e.g. "../shared".
        let projects = self.scan();
        let declaring_root = projects
            .iter()
            .filter(|p| p.is_workspace_root() && p.language_id() == owner.language_id())
            .find(|p| {
                workspace_info(lang.workspace, p.path(), p.marker())
                    .is_some_and(|info| info.declares(owner.path()))
            })
            .cloned();
        declaring_root.or(Some(owner))
    }

    fn project_at(&self, dir: &Path, lang: &LanguageMarkers) -> Option<ProjectRoot> {
        for marker in &lang.markers {
            if dir.join(marker).is_file() {
                return Some(self.make_project(dir, lang, marker.clone()));
            }
            if marker == COMPILE_COMMANDS
                && let Some(found) = probe_build_dirs(dir)
            {
                return Some(self.make_project(dir, lang, found));
            }
        }
        None
    }

    fn make_project(&self, dir: &Path, lang: &LanguageMarkers, marker: String) -> ProjectRoot {
        let is_workspace_root = workspace_info(lang.workspace, dir, &marker).is_some();
        ProjectRoot::new(
            dir.to_path_buf(),
            lang.language_id.clone(),
            marker,
            is_workspace_root,
        )
    }

    fn language(&self, language_id: &str) -> Option<&LanguageMarkers> {
        self.languages.iter().find(|l| l.language_id == language_id)
    }

    fn language_for_file(&self, file: &Path) -> Option<&LanguageMarkers> {
        let ext = file.extension()?.to_str()?;
        self.languages
            .iter()
            .find(|l| l.extensions.iter().any(|e| e == ext))
    }

    fn absolutize(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            normalize_path(path)
        } else {
            normalize_path(&self.root.join(path))
        }
    }
}

/// A compilation database found inside a build directory belongs to the
/// source directory above it.
fn attribute_build_dir(dir: &Path, marker: &str) -> (PathBuf, String) {
    if marker == COMPILE_COMMANDS
        && let Some(name) = dir.file_name().and_then(|n| n.to_str())
        && BUILD_DIRS.contains(&name)
        && let Some(parent) = dir.parent()
    {
        return (parent.to_path_buf(), format!("{name}/{marker}"));
    }
    (dir.to_path_buf(), marker.to_string())
}

/// `<build dir>/compile_commands.json` relative to `dir`, first match wins.
fn probe_build_dirs(dir: &Path) -> Option<String> {
    BUILD_DIRS
        .iter()
        .map(|b| format!("{b}/{COMPILE_COMMANDS}"))
        .find(|rel| dir.join(rel).is_file())
}

// ── Workspace manifests ────────────────────────────────────────────────────

/// Members declared by one workspace manifest.
#[derive(Debug)]
struct WorkspaceInfo {
    root: PathBuf,
    /// Glob patterns relative to `root`, `/`-separated.
    member_globs: GlobSet,
    exclude_globs: GlobSet,
    /// Members outside `root` (or given as plain paths), normalized.
    exact_members: Vec<PathBuf>,
    exact_excludes: Vec<PathBuf>,
}

impl WorkspaceInfo {
    fn new(root: &Path, members: &[String], excludes: &[String]) -> Self {
        let (member_globs, exact_members) = compile_patterns(root, members);
        let (exclude_globs, exact_excludes) = compile_patterns(root, excludes);
        Self {
            root: root.to_path_buf(),
            member_globs,
            exclude_globs,
            exact_members,
            exact_excludes,
        }
    }

    fn excludes(&self, dir: &Path) -> bool {
        self.exact_excludes.iter().any(|e| e == dir)
            || relative_slash_path(&self.root, dir).is_some_and(|rel| self.exclude_globs.is_match(rel))
    }

    /// `dir` is listed as a member.
    fn declares(&self, dir: &Path) -> bool {
        if self.excludes(dir) {
            return false;
        }
        self.exact_members.iter().any(|m| m == dir)
            || relative_slash_path(&self.root, dir).is_some_and(|rel| self.member_globs.is_match(rel))
    }

    /// `dir` is served by this workspace's root: declared, or nested under
    /// the root and not excluded.
    fn owns(&self, dir: &Path) -> bool {
        if dir == self.root {
            return false;
        }
        self.declares(dir) || (dir.starts_with(&self.root) && !self.excludes(dir))
    }
}

fn compile_patterns(root: &Path, patterns: &[String]) -> (GlobSet, Vec<PathBuf>) {
    let mut globs = GlobSetBuilder::new();
    let mut exact = Vec::new();
    for pattern in patterns {
        let absolute = normalize_path(&root.join(pattern));
        match relative_slash_path(root, &absolute) {
            Some(rel) if !rel.is_empty() => {
                match GlobBuilder::new(&rel).literal_separator(true).build() {
                    Ok(glob) => {
                        globs.add(glob);
                    }
                    Err(e) => tracing::debug!("Ignoring bad workspace pattern '{pattern}': {e}"),
                }
            }
            _ => exact.push(absolute),
        }
    }
    let set = globs.build().unwrap_or_else(|e| {
        tracing::debug!("Failed to build workspace glob set: {e}");
        GlobSet::empty()
    });
    (set, exact)
}

fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Parse the manifest behind `marker` if it declares a workspace.
fn workspace_info(kind: WorkspaceKind, dir: &Path, marker: &str) -> Option<WorkspaceInfo> {
    match kind {
        WorkspaceKind::Cargo if marker == "Cargo.toml" => cargo_workspace(dir),
        WorkspaceKind::TsconfigReferences if marker == "tsconfig.json" => tsconfig_references(dir),
        WorkspaceKind::GoWork if marker == "go.work" => go_work(dir),
        _ => None,
    }
}

fn cargo_workspace(dir: &Path) -> Option<WorkspaceInfo> {
    let text = std::fs::read_to_string(dir.join("Cargo.toml")).ok()?;
    let manifest: toml::Table = match toml::from_str(&text) {
        Ok(manifest) => manifest,
        Err(e) => {
            tracing::debug!("Unparsable Cargo.toml in {}: {e}", dir.display());
            return None;
        }
    };
    let workspace = manifest.get("workspace")?.as_table()?;
    let strings = |key: &str| -> Vec<String> {
        workspace
            .get(key)
            .and_then(toml::Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };
    Some(WorkspaceInfo::new(dir, &strings("members"), &strings("exclude")))
}

fn tsconfig_references(dir: &Path) -> Option<WorkspaceInfo> {
    let text = std::fs::read_to_string(dir.join("tsconfig.json")).ok()?;
    let config: serde_json::Value = match serde_json::from_str(&strip_jsonc(&text)) {
        Ok(config) => config,
        Err(e) => {
            tracing::debug!("Unparsable tsconfig.json in {}: {e}", dir.display());
            return None;
        }
    };
    let members: Vec<String> = config
        .get("references")?
        .as_array()?
        .iter()
        .filter_map(|r| r.get("path")?.as_str())
        .map(|p| {
            // A reference may name the config file rather than its directory.
            let path = Path::new(p);
            if path.extension().is_some_and(|e| e == "json") {
                path.parent()
                    .map_or_else(String::new, |d| d.to_string_lossy().into_owned())
            } else {
                p.to_string()
            }
        })
        .collect();
    if members.is_empty() {
        return None;
    }
    Some(WorkspaceInfo::new(dir, &members, &[]))
}

fn go_work(dir: &Path) -> Option<WorkspaceInfo> {
    let text = std::fs::read_to_string(dir.join("go.work")).ok()?;
    Some(WorkspaceInfo::new(dir, &parse_go_work_uses(&text), &[]))
}

/// Directories named by `use` directives, single-line or block form.
fn parse_go_work_uses(text: &str) -> Vec<String> {
    let mut uses = Vec::new();
    let mut in_block = false;
    for line in text.lines() {
        let line = line.split("//").next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if in_block {
            if line == ")" {
                in_block = false;
            } else {
                uses.push(unquote(line).to_string());
            }
            continue;
        }
        let Some(rest) = line.strip_prefix("use") else {
            continue;
        };
        if !rest.starts_with(|c: char| c.is_whitespace() || c == '(') {
            continue;
        }
        let rest = rest.trim();
        if rest == "(" {
            in_block = true;
        } else if !rest.is_empty() {
            uses.push(unquote(rest).to_string());
        }
    }
    uses
}

fn unquote(s: &str) -> &str {
    s.trim_matches('"').trim_matches('`')
}

/// Strip `//` and `/* */` comments and trailing commas from JSON-with-comments.
fn strip_jsonc(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some('/')) => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => out.push(c),
        }
    }
    remove_trailing_commas(&out)
}

fn remove_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
            out.push(c);
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if !matches!(next, Some('}' | ']')) {
                out.push(c);
            }
        } else {
            out.push(c);
        }
        i += 1;
    }
    out
}

/// Lexically normalize a path (resolve `.` and `..` without touching disk).
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = Vec::new();
    for c in path.components() {
        match c {
            Component::ParentDir => {
                if matches!(out.last(), Some(Component::Normal(_))) {
                    out.pop();
                }
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out.iter().collect()
}
