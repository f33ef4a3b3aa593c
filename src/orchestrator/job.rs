//! Job descriptors and their resolution into runnable plans
//!
//! A job lives in `<jobs_dir>/<name>.json`. Resolution checks everything a
//! run needs (binary, collection, batch files) up front, so configuration
//! problems reject the job before it is admitted.

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::config::EngineConfig;
use crate::common::{Error, Result};
use crate::engine::ProcessAdapter;

/// What a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// The target executable, directly or through a collection
    #[default]
    Binary,
    /// A scenario file or directory; requires `collection`
    Scenario,
}

/// On-disk job definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    /// Taken from the file stem
    #[serde(skip)]
    pub name: String,

    #[serde(rename = "type", default)]
    pub job_type: JobType,

    /// Target executable; falls back to `[engine] binary_path`
    pub binary_path: Option<PathBuf>,

    /// Per-step timeout in milliseconds
    pub timeout: Option<u64>,

    /// Arguments for a plain run, in declaration order
    #[serde(default)]
    pub arguments: IndexMap<String, serde_json::Value>,

    /// Extra environment for the child process
    #[serde(default)]
    pub environment: IndexMap<String, String>,

    /// Scenario file or directory of scenario files
    pub collection: Option<PathBuf>,

    /// Globs of batch files to skip
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Batch fan-out; falls back to `[orchestrator] batch_concurrency`
    pub concurrency: Option<usize>,

    /// Output decoding label
    pub encoding: Option<String>,
}

impl JobDescriptor {
    /// Parse a descriptor from JSON text
    pub fn from_json(name: &str, content: &str) -> Result<Self> {
        let mut descriptor: JobDescriptor = serde_json::from_str(content)
            .map_err(|e| Error::invalid_job(name, &e.to_string()))?;
        descriptor.name = name.to_string();
        Ok(descriptor)
    }

    /// Arguments rendered as ordered `key=value` pairs
    pub fn argument_pairs(&self) -> Vec<(String, String)> {
        self.arguments
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}

/// What a resolved job will execute
#[derive(Debug, Clone, PartialEq)]
pub enum JobPlan {
    /// One invocation with the descriptor's arguments
    Plain,
    /// One scenario file
    Scenario(PathBuf),
    /// Every remaining scenario file of a directory, in name order
    Batch { dir: PathBuf, files: Vec<PathBuf> },
}

impl JobPlan {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPlan::Plain => "plain",
            JobPlan::Scenario(_) => "scenario",
            JobPlan::Batch { .. } => "batch",
        }
    }
}

/// A job checked against the filesystem and ready to run
#[derive(Debug, Clone)]
pub struct ResolvedJob {
    pub descriptor: JobDescriptor,
    pub binary: PathBuf,
    pub plan: JobPlan,
    pub timeout: Duration,
    pub encoding: String,
}

impl ResolvedJob {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Process adapter configured for this job
    pub fn adapter(&self) -> ProcessAdapter {
        ProcessAdapter::new(&self.binary)
            .with_timeout(self.timeout)
            .with_encoding(&self.encoding)
            .with_env(self.descriptor.environment.clone())
    }

    /// Batch fan-out, at least 1
    pub fn concurrency(&self, default: usize) -> usize {
        self.descriptor.concurrency.unwrap_or(default).max(1)
    }

    /// Collection path as shown in reports and alerts
    pub fn collection_label(&self) -> Option<String> {
        match &self.plan {
            JobPlan::Plain => None,
            JobPlan::Scenario(path) => Some(path.display().to_string()),
            JobPlan::Batch { dir, .. } => Some(dir.display().to_string()),
        }
    }
}

/// Where job descriptors come from
pub trait JobSource: Send + Sync {
    /// Load the named descriptor
    fn load(&self, name: &str) -> Result<JobDescriptor>;

    /// Directory relative paths in descriptors resolve against
    fn root(&self) -> &Path;

    /// Load and resolve the named job
    fn resolve(&self, name: &str, engine: &EngineConfig) -> Result<ResolvedJob> {
        resolve(self.load(name)?, self.root(), engine)
    }
}

/// Descriptors stored as `<dir>/<name>.json`
#[derive(Debug, Clone)]
pub struct DirJobSource {
    dir: PathBuf,
    root: PathBuf,
}

impl DirJobSource {
    /// Relative paths resolve against the jobs directory's parent
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let root = dir
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self { dir, root }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl JobSource for DirJobSource {
    fn load(&self, name: &str) -> Result<JobDescriptor> {
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(Error::invalid_job(name, "job names are plain file stems"));
        }
        let path = self.dir.join(format!("{}.json", name));
        if !path.is_file() {
            return Err(Error::JobNotFound(name.to_string()));
        }
        let content = std::fs::read_to_string(&path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        JobDescriptor::from_json(name, &content)
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

/// In-memory descriptors, for front doors that build jobs on the fly
#[derive(Debug, Clone, Default)]
pub struct StaticJobs {
    jobs: IndexMap<String, JobDescriptor>,
    root: PathBuf,
}

impl StaticJobs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            jobs: IndexMap::new(),
            root: root.into(),
        }
    }

    pub fn with_job(mut self, name: &str, mut descriptor: JobDescriptor) -> Self {
        descriptor.name = name.to_string();
        self.jobs.insert(name.to_string(), descriptor);
        self
    }
}

impl JobSource for StaticJobs {
    fn load(&self, name: &str) -> Result<JobDescriptor> {
        self.jobs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::JobNotFound(name.to_string()))
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

/// Resolve a descriptor against `root`
pub fn resolve(descriptor: JobDescriptor, root: &Path, engine: &EngineConfig) -> Result<ResolvedJob> {
    let name = descriptor.name.clone();

    let binary = descriptor
        .binary_path
        .clone()
        .or_else(|| engine.binary_path.clone())
        .ok_or_else(|| Error::invalid_job(&name, "no binaryPath and no [engine] binary_path"))?;
    let binary = resolve_binary(&binary, root)?;

    let plan = match &descriptor.collection {
        None if descriptor.job_type == JobType::Scenario => {
            return Err(Error::invalid_job(&name, "scenario jobs need a collection"));
        }
        None => JobPlan::Plain,
        Some(collection) => {
            let path = root.join(collection);
            if path.is_dir() {
                let files = batch_files(&path, &descriptor.exclude_patterns)?;
                JobPlan::Batch { dir: path, files }
            } else if path.is_file() && is_scenario_file(&path) {
                JobPlan::Scenario(path)
            } else {
                return Err(Error::scenario_load(&path, "collection not found"));
            }
        }
    };

    let timeout = Duration::from_millis(descriptor.timeout.unwrap_or(engine.timeout_ms));
    let encoding = descriptor
        .encoding
        .clone()
        .unwrap_or_else(|| engine.effective_encoding().to_string());

    tracing::debug!(job = %name, binary = %binary.display(), plan = plan.kind(), "Resolved job");

    Ok(ResolvedJob {
        descriptor,
        binary,
        plan,
        timeout,
        encoding,
    })
}

/// Locate the target executable
///
/// Paths with a directory part resolve against `root`. A bare name is tried
/// under `root` first, then on `PATH`.
pub fn resolve_binary(binary: &Path, root: &Path) -> Result<PathBuf> {
    let local = root.join(binary);
    if local.is_file() {
        return Ok(local);
    }

    let bare = binary.components().count() == 1 && !binary.is_absolute();
    if bare {
        if let Ok(found) = which::which(binary) {
            return Ok(found);
        }
    }
    Err(Error::BinaryNotFound(local))
}

fn is_scenario_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
        .unwrap_or(false)
}

/// Translate an exclude glob into a case-insensitive, unanchored regex
///
/// `*` and `**` match any run of characters, `?` one character; everything
/// else is literal.
pub fn exclude_regex(pattern: &str) -> Result<Regex> {
    let mut source = String::from("(?i)");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                while chars.peek() == Some(&'*') {
                    chars.next();
                }
                source.push_str(".*");
            }
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    Regex::new(&source).map_err(|e| Error::Config(format!("exclude pattern '{}': {}", pattern, e)))
}

/// Scenario files of `dir` in name order, minus excluded ones
pub fn batch_files(dir: &Path, exclude_patterns: &[String]) -> Result<Vec<PathBuf>> {
    let excludes = exclude_patterns
        .iter()
        .map(|p| exclude_regex(p))
        .collect::<Result<Vec<_>>>()?;

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || !is_scenario_file(&path) {
            continue;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let relative = path
            .strip_prefix(dir)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| file_name.clone());

        if let Some(re) = excludes
            .iter()
            .find(|re| re.is_match(&file_name) || re.is_match(&relative))
        {
            tracing::debug!(file = %file_name, pattern = %re.as_str(), "Excluded from batch");
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}
