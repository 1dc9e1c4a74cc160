// src/watch/patterns.rs

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;

use crate::config::WatchConfig;

/// Namespace used when a path has no directory component.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Compiled include/exclude globs.
///
/// Patterns are relative to the watch root; [`PathFilter::matches`] takes
/// relative paths with forward slashes (e.g. `"src/main.rs"`).
#[derive(Clone)]
pub struct PathFilter {
    include: GlobSet,
    exclude: Option<GlobSet>,
}

impl fmt::Debug for PathFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathFilter")
            .field("include", &self.include.len())
            .field("exclude", &self.exclude.as_ref().map_or(0, GlobSet::len))
            .finish()
    }
}

impl PathFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let include = build_globset(include).context("building include globset")?;
        let exclude = if exclude.is_empty() {
            None
        } else {
            Some(build_globset(exclude).context("building exclude globset")?)
        };
        Ok(Self { include, exclude })
    }

    pub fn matches(&self, rel_path: &str) -> bool {
        if !self.include.is_match(rel_path) {
            return false;
        }
        !self.exclude.as_ref().is_some_and(|ex| ex.is_match(rel_path))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let glob = Glob::new(pat).with_context(|| format!("invalid glob pattern: {pat}"))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

/// Derives `(namespace, module)` from a relative path.
///
/// With a `module_pattern`, its `namespace` / `module` named captures win.
/// Otherwise, and for captures that did not participate, the first directory
/// is the namespace and the second directory the module; a missing module
/// falls back to the file stem.
#[derive(Debug, Clone, Default)]
pub struct ModuleResolver {
    pattern: Option<Regex>,
}

impl ModuleResolver {
    pub fn new(pattern: Option<&str>) -> Result<Self> {
        let pattern = pattern
            .map(|p| Regex::new(p).with_context(|| format!("invalid module_pattern: {p}")))
            .transpose()?;
        Ok(Self { pattern })
    }

    pub fn resolve(&self, rel_path: &str) -> (String, String) {
        let mut dirs: Vec<&str> = rel_path.split('/').filter(|s| !s.is_empty()).collect();
        let file = dirs.pop().unwrap_or(rel_path);
        let stem = Path::new(file)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.to_string());

        let mut namespace = dirs.first().map(|s| s.to_string());
        let mut module = dirs.get(1).map(|s| s.to_string());

        if let Some(caps) = self.pattern.as_ref().and_then(|re| re.captures(rel_path)) {
            if let Some(m) = caps.name("namespace") {
                namespace = Some(m.as_str().to_string());
            }
            if let Some(m) = caps.name("module") {
                module = Some(m.as_str().to_string());
            }
        }

        (
            namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            module.unwrap_or(stem),
        )
    }
}

/// Everything the watcher needs to decide about a path, compiled once.
#[derive(Debug, Clone)]
pub struct WatchRules {
    pub filter: PathFilter,
    pub resolver: ModuleResolver,
}

impl WatchRules {
    pub fn from_config(cfg: &WatchConfig) -> Result<Self> {
        Ok(Self {
            filter: PathFilter::new(&cfg.include, &cfg.exclude)?,
            resolver: ModuleResolver::new(cfg.module_pattern.as_deref())?,
        })
    }
}

/// `path` relative to `root`, with forward slashes.
///
/// Falls back to comparing canonical paths, which helps where the same
/// directory is reachable through different absolute prefixes (symlinks,
/// `/private/var` on macOS). Deleted files cannot be canonicalized, so their
/// parent directory is used instead.
pub fn relative_str(root: &Path, path: &Path) -> Option<String> {
    let normalize = |rel: &Path| rel.to_string_lossy().replace('\\', "/");

    if let Ok(rel) = path.strip_prefix(root) {
        return Some(normalize(rel));
    }

    let root_canon = root.canonicalize().ok()?;
    if let Ok(canon) = path.canonicalize() {
        return canon.strip_prefix(&root_canon).ok().map(normalize);
    }
    let parent = path.parent()?.canonicalize().ok()?;
    let rel = parent.strip_prefix(&root_canon).ok()?;
    let joined = rel.join(path.file_name()?);
    Some(normalize(joined.as_path()))
}
