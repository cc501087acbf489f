//! Best-effort discovery of chain files next to a leaf certificate.
//!
//! Discovery works on file names, not on certificate relationships: it can
//! pick up unrelated certificates that share a directory with the leaf, it
//! can miss chain files with unusual names, and it orders results
//! lexicographically, which need not be issuance order. DER chain files are
//! only found through name patterns, never by content.

use crate::chain::assemble_explicit;
use crate::pem::contains_certificate;
use crate::scratch::ScratchDir;
use crate::types::AssembledChain;
use certgate_core::{CertificateError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const CHAIN_EXTENSIONS: [&str; 3] = ["crt", "pem", "cer"];
const CHAIN_NAME_PATTERNS: [&str; 5] = ["chain*", "intermediate*", "ca*", "*chain*", "*intermediate*"];

/// Input of a discovery run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub leaf_path: PathBuf,
    pub key_path: PathBuf,
    /// Directory to search; defaults to the leaf's directory
    #[serde(default)]
    pub search_dir: Option<PathBuf>,
    /// Glob patterns relative to the search directory; empty means the
    /// built-in name heuristics
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// A chain assembled from discovered files.
#[derive(Debug, Clone)]
pub struct DiscoveredChain {
    pub assembled: AssembledChain,
    /// Chain files in the order they were added, relative to the search
    /// directory when possible
    pub chain_files: Vec<PathBuf>,
}

/// Finds chain files for `request`, sorted by absolute path.
///
/// # Errors
///
/// `ChainFileNotFound` if the search directory does not exist.
pub fn discover_chain_files(request: &DiscoveryRequest) -> Result<Vec<PathBuf>> {
    let leaf = absolutize(&request.leaf_path)?;
    let key = absolutize(&request.key_path)?;
    let search_dir = match &request.search_dir {
        Some(dir) => absolutize(dir)?,
        None => leaf
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/")),
    };

    if !search_dir.is_dir() {
        return Err(CertificateError::chain_file_not_found(search_dir.display().to_string()).into());
    }

    warn!(
        dir = %search_dir.display(),
        "Chain discovery is name-based: unrelated certificates may be included, \
         unusual names may be missed, results are sorted by path rather than by \
         issuer, and DER files are not inspected by content"
    );

    let excluded = |path: &Path| path == leaf || path == key;
    let mut found = BTreeSet::new();

    if !request.patterns.is_empty() {
        for pattern in &request.patterns {
            for path in glob(&search_dir, pattern)? {
                if !excluded(&path) {
                    found.insert(path);
                }
            }
        }
    } else {
        let leaf_stem = lower_stem(&leaf);
        let key_stem = lower_stem(&key);
        let resembles_input = |path: &Path| {
            let stem = lower_stem(path);
            [&leaf_stem, &key_stem]
                .iter()
                .any(|s| !s.is_empty() && stem.starts_with(s.as_str()))
        };

        for name in CHAIN_NAME_PATTERNS {
            for ext in CHAIN_EXTENSIONS {
                for path in glob(&search_dir, &format!("{}.{}", name, ext))? {
                    if !excluded(&path) && !resembles_input(&path) {
                        found.insert(path);
                    }
                }
            }
        }

        for ext in CHAIN_EXTENSIONS {
            for path in glob(&search_dir, &format!("*.{}", ext))? {
                if excluded(&path) || found.contains(&path) {
                    continue;
                }
                match std::fs::read(&path) {
                    Ok(content) if contains_certificate(&content) => {
                        found.insert(path);
                    }
                    Ok(_) => {}
                    Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable file"),
                }
            }
        }
    }

    let files: Vec<PathBuf> = found.into_iter().collect();
    info!(dir = %search_dir.display(), count = files.len(), "Discovered chain files");
    Ok(files)
}

/// Discovers chain files for `request` and assembles leaf, key and chain.
pub fn assemble_discovered(
    request: &DiscoveryRequest,
    passphrase: Option<&str>,
) -> Result<DiscoveredChain> {
    let leaf = read_input(&request.leaf_path)?;
    let key = read_input(&request.key_path)?;
    let files = discover_chain_files(request)?;

    let intermediates = files
        .iter()
        .map(|p| read_input(p))
        .collect::<Result<Vec<_>>>()?;
    let assembled = assemble_explicit(&leaf, &key, &intermediates, passphrase)?;

    Ok(DiscoveredChain {
        assembled,
        chain_files: files,
    })
}

/// A named in-memory file.
#[derive(Clone, Serialize, Deserialize)]
pub struct NamedContent {
    pub name: String,
    pub content: Vec<u8>,
}

impl NamedContent {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

impl std::fmt::Debug for NamedContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedContent")
            .field("name", &self.name)
            .field("len", &self.content.len())
            .finish()
    }
}

/// Runs discovery over uploaded files instead of a directory.
///
/// Everything is materialized into a private scratch directory that is
/// removed before this function returns. Reported chain files are bare
/// names.
pub fn discover_in_contents(
    leaf: &NamedContent,
    key: &NamedContent,
    files: &[NamedContent],
    patterns: &[String],
    passphrase: Option<&str>,
) -> Result<DiscoveredChain> {
    let scratch = ScratchDir::new()?;
    let leaf_path = scratch.write(&leaf.name, &leaf.content)?;
    let key_path = scratch.write(&key.name, &key.content)?;
    for file in files {
        scratch.write(&file.name, &file.content)?;
    }

    let request = DiscoveryRequest {
        leaf_path,
        key_path,
        search_dir: Some(scratch.path().to_path_buf()),
        patterns: patterns.to_vec(),
    };
    let mut discovered = assemble_discovered(&request, passphrase)?;
    discovered.chain_files = discovered
        .chain_files
        .iter()
        .filter_map(|p| p.file_name().map(PathBuf::from))
        .collect();

    Ok(discovered)
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|_| CertificateError::chain_file_not_found(path.display().to_string()).into())
}

fn lower_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Absolute, lexically normalized form of `path`.
fn absolutize(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

/// Shell-style glob (`*`, `?`) over files below `dir`. Hidden files are
/// skipped, as a shell would.
fn glob(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let pattern = pattern.trim_start_matches("./");
    let depth = pattern.split('/').count();
    let matcher = glob_regex(pattern)?;

    let mut matches = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() || entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if matcher.is_match(&relative) {
            matches.push(entry.path().to_path_buf());
        }
    }
    Ok(matches)
}

fn glob_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str("[^/]*"),
            '?' => expr.push_str("[^/]"),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| CertificateError::unsupported(format!("invalid pattern: {}", e)).into())
}
