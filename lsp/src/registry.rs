//! Language server registry: one descriptor per supported language.
//!
//! A descriptor is static data plus two small per-project builders
//! ([`ServerDescriptor::launch_args`] and
//! [`ServerDescriptor::initialization_options`]). Built-ins cover Rust,
//! TypeScript/JavaScript, Python, Go and C/C++; the config file can override
//! any field or add new languages.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::{LspConfig, ServerConfig};
use crate::types::ProjectRoot;

pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_INDEXING_TIMEOUT: Duration = Duration::from_secs(30);

const COMPILE_COMMANDS: &str = "compile_commands.json";

/// Flags clangd falls back to when no compilation database exists.
const CLANGD_FALLBACK_FLAGS: &[&str] = &["-std=c++17", "-xc++", "-I.", "-Iinclude", "-Isrc"];

/// How a language groups projects into a multi-member workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceKind {
    /// Every marker is its own project.
    #[default]
    None,
    /// `Cargo.toml` with a `[workspace]` table and `members` globs.
    Cargo,
    /// `tsconfig.json` with a `references` array.
    TsconfigReferences,
    /// `go.work` with `use` directives.
    GoWork,
}

/// Everything needed to launch and talk to one language server.
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    /// Registry key and `ProjectRoot::language_id` (e.g. "rust").
    pub language_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub file_extensions: Vec<String>,
    /// Marker file names, in priority order.
    pub root_markers: Vec<String>,
    pub workspace: WorkspaceKind,
    pub initialization_options: Option<Value>,
    /// Handshake budget; heavy indexers get a longer one.
    pub init_timeout: Duration,
    pub request_timeout: Duration,
    /// Soft ceiling for the indexing waiter.
    pub indexing_timeout: Duration,
}

impl ServerDescriptor {
    fn new(language_id: &str, command: &str) -> Self {
        Self {
            language_id: language_id.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            file_extensions: Vec::new(),
            root_markers: Vec::new(),
            workspace: WorkspaceKind::None,
            initialization_options: None,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            indexing_timeout: DEFAULT_INDEXING_TIMEOUT,
        }
    }

    fn args(mut self, args: &[&str]) -> Self {
        self.args = to_strings(args);
        self
    }

    fn extensions(mut self, exts: &[&str]) -> Self {
        self.file_extensions = to_strings(exts);
        self
    }

    fn markers(mut self, markers: &[&str]) -> Self {
        self.root_markers = to_strings(markers);
        self
    }

    fn workspace(mut self, kind: WorkspaceKind) -> Self {
        self.workspace = kind;
        self
    }

    fn init_options(mut self, options: Value) -> Self {
        self.initialization_options = Some(options);
        self
    }

    fn timeouts(mut self, init: u64, request: u64, indexing: u64) -> Self {
        self.init_timeout = Duration::from_secs(init);
        self.request_timeout = Duration::from_secs(request);
        self.indexing_timeout = Duration::from_secs(indexing);
        self
    }

    /// Command-line arguments for a server rooted at `project`.
    ///
    /// clangd is pointed at the build directory that holds the compilation
    /// database when it is not at the project root.
    #[must_use]
    pub fn launch_args(&self, project: &ProjectRoot) -> Vec<String> {
        let mut args = self.args.clone();
        if self.command == "clangd"
            && let Some(dir) = compile_commands_dir(project)
            && !args.iter().any(|a| a.starts_with("--compile-commands-dir"))
        {
            args.push(format!("--compile-commands-dir={}", dir.display()));
        }
        args
    }

    /// `initializationOptions` for a server rooted at `project`.
    ///
    /// clangd without a compilation database gets fallback flags.
    #[must_use]
    pub fn initialization_options(&self, project: &ProjectRoot) -> Option<Value> {
        let mut options = self.initialization_options.clone();
        if self.command == "clangd" && !has_compile_commands(project) {
            let obj = options.get_or_insert_with(|| json!({}));
            if let Some(map) = obj.as_object_mut() {
                map.entry("fallbackFlags")
                    .or_insert_with(|| json!(CLANGD_FALLBACK_FLAGS));
            }
        }
        options
    }

    /// `languageId` sent in `didOpen` for `path`.
    #[must_use]
    pub fn document_language_id(&self, path: &Path) -> String {
        document_language_id(&self.language_id, path)
    }

    fn apply(&mut self, overrides: &ServerConfig) {
        if let Some(command) = &overrides.command {
            self.command.clone_from(command);
        }
        if let Some(args) = &overrides.args {
            self.args.clone_from(args);
        }
        if let Some(exts) = &overrides.file_extensions {
            self.file_extensions.clone_from(exts);
        }
        if let Some(markers) = &overrides.root_markers {
            self.root_markers.clone_from(markers);
        }
        if let Some(kind) = overrides.workspace {
            self.workspace = kind;
        }
        if let Some(options) = &overrides.initialization_options {
            self.initialization_options = Some(options.clone());
        }
        if let Some(secs) = overrides.init_timeout_secs {
            self.init_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.request_timeout_secs {
            self.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.indexing_timeout_secs {
            self.indexing_timeout = Duration::from_secs(secs);
        }
    }
}

/// `languageId` for a document served by `language_id`.
///
/// Mixed-dialect servers distinguish e.g. `typescriptreact` from
/// `typescript`; everything else uses the server's own id.
#[must_use]
pub fn document_language_id(language_id: &str, path: &Path) -> String {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let dialect = match (language_id, ext) {
        ("typescript", "tsx") => "typescriptreact",
        ("typescript", "js" | "mjs" | "cjs") => "javascript",
        ("typescript", "jsx") => "javascriptreact",
        ("cpp", "c") => "c",
        _ => language_id,
    };
    dialect.to_string()
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn has_compile_commands(project: &ProjectRoot) -> bool {
    project.marker().ends_with(COMPILE_COMMANDS)
}

/// Build directory holding the compilation database, if it is not the root.
fn compile_commands_dir(project: &ProjectRoot) -> Option<std::path::PathBuf> {
    if !has_compile_commands(project) {
        return None;
    }
    let parent = Path::new(project.marker()).parent()?;
    if parent.as_os_str().is_empty() {
        return None;
    }
    Some(project.path().join(parent))
}

/// The set of languages this process can serve.
#[derive(Debug, Clone)]
pub struct ServerRegistry {
    servers: BTreeMap<String, ServerDescriptor>,
    /// File extension (e.g. "rs") → language id (e.g. "rust").
    extension_map: HashMap<String, String>,
}

impl ServerRegistry {
    /// Built-in descriptors only.
    #[must_use]
    pub fn builtin() -> Self {
        Self::from_descriptors(builtin_descriptors())
    }

    /// Built-ins with config overrides and additions applied.
    #[must_use]
    pub fn from_config(config: &LspConfig) -> Self {
        let mut servers: BTreeMap<String, ServerDescriptor> = builtin_descriptors()
            .into_iter()
            .map(|d| (d.language_id.clone(), d))
            .collect();

        for (name, overrides) in &config.servers {
            if !overrides.enabled {
                tracing::debug!("Language server '{name}' disabled by config");
                servers.remove(name);
                continue;
            }
            if let Some(existing) = servers.get_mut(name) {
                existing.apply(overrides);
                continue;
            }
            let Some(command) = &overrides.command else {
                tracing::warn!("Ignoring config for unknown language '{name}': no command set");
                continue;
            };
            let language_id = overrides.language_id.as_deref().unwrap_or(name);
            let mut descriptor = ServerDescriptor::new(language_id, command);
            descriptor.apply(overrides);
            if descriptor.file_extensions.is_empty() || descriptor.root_markers.is_empty() {
                tracing::warn!(
                    "Language server '{name}' has no file_extensions or root_markers; it will never be selected"
                );
            }
            servers.insert(language_id.to_string(), descriptor);
        }

        Self::from_descriptors(servers.into_values().collect())
    }

    fn from_descriptors(descriptors: Vec<ServerDescriptor>) -> Self {
        let servers: BTreeMap<String, ServerDescriptor> = descriptors
            .into_iter()
            .map(|d| (d.language_id.clone(), d))
            .collect();
        let extension_map = build_extension_map(&servers);
        Self {
            servers,
            extension_map,
        }
    }

    #[must_use]
    pub fn get(&self, language_id: &str) -> Option<&ServerDescriptor> {
        self.servers.get(language_id)
    }

    /// Descriptors in language id order.
    pub fn iter(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.servers.values()
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    /// Language id serving files like `path`, by extension.
    #[must_use]
    pub fn language_for_path(&self, path: &Path) -> Option<&str> {
        let ext = path.extension()?.to_str()?;
        self.extension_map.get(ext).map(String::as_str)
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn build_extension_map(servers: &BTreeMap<String, ServerDescriptor>) -> HashMap<String, String> {
    let mut extension_map = HashMap::new();
    for (name, descriptor) in servers {
        for ext in &descriptor.file_extensions {
            if let Some(existing) = extension_map.get(ext) {
                tracing::warn!(
                    "Multiple language servers configured for extension '{ext}': '{existing}' and '{name}'. Using '{existing}'."
                );
                continue;
            }
            extension_map.insert(ext.clone(), name.clone());
        }
    }
    extension_map
}

fn builtin_descriptors() -> Vec<ServerDescriptor> {
    vec![
        ServerDescriptor::new("rust", "rust-analyzer")
            .extensions(&["rs"])
            .markers(&["Cargo.toml"])
            .workspace(WorkspaceKind::Cargo)
            // Keep startup cheap: no build scripts, proc macros or cargo check.
            .init_options(json!({
                "cargo": { "buildScripts": { "enable": false } },
                "procMacro": { "enable": false },
                "checkOnSave": false,
                "cachePriming": { "enable": false },
            }))
            .timeouts(120, 60, 90),
        ServerDescriptor::new("typescript", "typescript-language-server")
            .args(&["--stdio"])
            .extensions(&["ts", "tsx", "mts", "cts", "js", "jsx", "mjs", "cjs"])
            .markers(&["tsconfig.json", "jsconfig.json", "package.json"])
            .workspace(WorkspaceKind::TsconfigReferences)
            .init_options(json!({ "maxTsServerMemory": 4096 }))
            .timeouts(60, 30, 60),
        ServerDescriptor::new("python", "pyright-langserver")
            .args(&["--stdio"])
            .extensions(&["py", "pyi"])
            .markers(&[
                "pyproject.toml",
                "setup.py",
                "setup.cfg",
                "pyrightconfig.json",
                "requirements.txt",
            ]),
        ServerDescriptor::new("go", "gopls")
            .extensions(&["go"])
            .markers(&["go.work", "go.mod"])
            .workspace(WorkspaceKind::GoWork)
            .init_options(json!({
                "directoryFilters": ["-**/node_modules", "-**/.git", "-**/vendor"],
            }))
            .timeouts(60, 30, 60),
        ServerDescriptor::new("cpp", "clangd")
            .args(&["--background-index", "--header-insertion=never"])
            .extensions(&["c", "h", "cc", "cpp", "cxx", "hpp", "hh", "hxx"])
            .markers(&[COMPILE_COMMANDS])
            .timeouts(60, 30, 120),
    ]
}
