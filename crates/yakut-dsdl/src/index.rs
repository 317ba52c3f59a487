//! Namespace indexing for the `compile` command.
//!
//! A DSDL root namespace is a directory tree of `[PORT.]Short.MAJOR.MINOR.dsdl`
//! definitions. Compiling it validates the tree and writes
//! `<output>/<root>/index.json`, which other commands consult to tell a type
//! that was never compiled apart from one that is known but lacks a codec.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DsdlError, Result};

/// Name of the index file inside each compiled namespace directory.
pub const INDEX_FILE_NAME: &str = "index.json";

#[allow(clippy::expect_used)] // literal patterns, compiled in tests
static RE_ROOT_NAMESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_]\w*$").expect("pattern is valid"));
#[allow(clippy::expect_used)]
static RE_DEFINITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(\d+)\.)?([a-zA-Z_][a-zA-Z0-9_]*)\.(\d+)\.(\d+)\.dsdl$").expect("pattern is valid")
});

/// Whether `name` is acceptable as a root namespace directory name.
#[must_use]
pub fn is_valid_root_namespace_name(name: &str) -> bool {
    RE_ROOT_NAMESPACE.is_match(name)
}

/// Hint telling the user how to make a namespace available.
#[must_use]
pub fn make_usage_suggestion(root_namespace: Option<&str>) -> String {
    let root = root_namespace
        .and_then(|ns| ns.split('.').next())
        .filter(|s| !s.is_empty())
        .unwrap_or("<namespace>");
    format!("Run `yakut compile <path>/{root}` to compile DSDL namespace {root:?}")
}

/// Message or service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Message definition.
    Message,
    /// Service definition (contains a `---` separator).
    Service,
}

/// One definition found in a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Full name without version.
    pub name: String,
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Fixed port-ID, if the file name declares one.
    pub fixed_port_id: Option<u16>,
    /// Message or service.
    pub kind: EntryKind,
    /// Definition file.
    pub source: PathBuf,
}

impl IndexEntry {
    /// Namespace part of the name.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.name.rsplit_once('.').map_or("", |(ns, _)| ns)
    }

    /// Short name.
    #[must_use]
    pub fn short_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }
}

/// Contents of an `index.json` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceIndex {
    /// Root namespace name.
    pub root: String,
    /// Directory the namespace was compiled from.
    pub source_dir: PathBuf,
    /// SHA-256 over the definition files, hex encoded.
    pub digest: String,
    /// Definitions sorted by name and version.
    pub entries: Vec<IndexEntry>,
}

impl NamespaceIndex {
    /// Finds the newest matching entry; the short name is compared ignoring case.
    #[must_use]
    pub fn find(&self, namespace: &str, short_name: &str, major: Option<u8>, minor: Option<u8>) -> Option<&IndexEntry> {
        self.entries
            .iter()
            .filter(|e| {
                e.namespace() == namespace
                    && e.short_name().eq_ignore_ascii_case(short_name)
                    && major.is_none_or(|m| e.major == m)
                    && minor.is_none_or(|m| e.minor == m)
            })
            .max_by_key(|e| (e.major, e.minor))
    }

    /// Reads an index file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| DsdlError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Loads every `<dir>/<root>/index.json` found under the given directories.
/// Unreadable indexes are logged and skipped.
#[must_use]
pub fn load_indexes(dirs: &[PathBuf]) -> Vec<NamespaceIndex> {
    let mut out = Vec::new();
    for dir in dirs {
        let Ok(children) = std::fs::read_dir(dir) else {
            continue;
        };
        let mut paths: Vec<PathBuf> = children
            .filter_map(std::result::Result::ok)
            .map(|e| e.path().join(INDEX_FILE_NAME))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        for path in paths {
            match NamespaceIndex::read(&path) {
                Ok(index) => out.push(index),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable namespace index"),
            }
        }
    }
    out
}

fn is_service_definition(text: &str) -> bool {
    text.lines().any(|line| {
        let code = line.split('#').next().unwrap_or("").trim();
        code.chars().all(|c| c == '-') && code.len() >= 3
    })
}

fn namespace_error(path: &Path, message: impl Into<String>) -> DsdlError {
    DsdlError::Namespace {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

/// Scans a root namespace directory, returning its definitions and content digest.
///
/// # Errors
///
/// Returns an error for unreadable files, malformed definition file names,
/// invalid versions, or nested directories that are not identifiers.
pub fn scan_root_namespace(root_dir: &Path) -> Result<(Vec<IndexEntry>, String)> {
    let root = root_dir
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| is_valid_root_namespace_name(n))
        .ok_or_else(|| namespace_error(root_dir, "not a valid root namespace directory name"))?
        .to_owned();
    let mut entries = Vec::new();
    let mut hasher = Sha256::new();
    walk(root_dir, &root, &mut entries, &mut hasher)?;
    entries.sort_by(|a: &IndexEntry, b| (&a.name, a.major, a.minor).cmp(&(&b.name, b.major, b.minor)));
    let digest = hasher.finalize().iter().map(|b| format!("{b:02x}")).collect();
    Ok((entries, digest))
}

fn walk(dir: &Path, namespace: &str, entries: &mut Vec<IndexEntry>, hasher: &mut Sha256) -> Result<()> {
    let io = |source| DsdlError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut items: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io)?
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .collect();
    items.sort();
    for path in items {
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_owned();
        if file_name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            if !is_valid_root_namespace_name(&file_name) {
                return Err(namespace_error(&path, "nested namespace name is not an identifier"));
            }
            walk(&path, &format!("{namespace}.{file_name}"), entries, hasher)?;
            continue;
        }
        if !file_name.ends_with(".dsdl") {
            continue;
        }
        let caps = RE_DEFINITION
            .captures(&file_name)
            .ok_or_else(|| namespace_error(&path, "definition file name must be [PORT.]Short.MAJOR.MINOR.dsdl"))?;
        let number = |i: usize| caps.get(i).map(|m| m.as_str().parse::<u32>());
        let fixed_port_id = match number(1) {
            None => None,
            Some(Ok(p)) => Some(u16::try_from(p).map_err(|_| namespace_error(&path, "port-ID out of range"))?),
            Some(Err(_)) => return Err(namespace_error(&path, "port-ID out of range")),
        };
        let version = |i: usize| -> Result<u8> {
            match number(i) {
                Some(Ok(v)) => u8::try_from(v).map_err(|_| namespace_error(&path, "version number out of range")),
                _ => Err(namespace_error(&path, "version number out of range")),
            }
        };
        let (major, minor) = (version(3)?, version(4)?);
        if major == 0 && minor == 0 {
            return Err(namespace_error(&path, "version 0.0 is not allowed"));
        }
        let text = std::fs::read_to_string(&path).map_err(|source| DsdlError::Io {
            path: path.clone(),
            source,
        })?;
        hasher.update(file_name.as_bytes());
        hasher.update(text.as_bytes());
        let short = caps.get(2).map_or("", |m| m.as_str());
        entries.push(IndexEntry {
            name: format!("{namespace}.{short}"),
            major,
            minor,
            fixed_port_id,
            kind: if is_service_definition(&text) {
                EntryKind::Service
            } else {
                EntryKind::Message
            },
            source: path.clone(),
        });
    }
    Ok(())
}

/// Whether a fixed port-ID lies in the regulated range for its root namespace.
#[must_use]
pub fn is_regulated_port_id(root: &str, kind: EntryKind, port_id: u16) -> bool {
    match (root == "uavcan", kind) {
        (true, EntryKind::Message) => (7168..=8191).contains(&port_id),
        (false, EntryKind::Message) => (6144..=7167).contains(&port_id),
        (true, EntryKind::Service) => (384..=511).contains(&port_id),
        (false, EntryKind::Service) => (256..=383).contains(&port_id),
    }
}

fn validate(entries: &[&IndexEntry], allow_unregulated_fixed_port_id: bool) -> Result<()> {
    let mut seen: BTreeMap<(String, u8, u8), &IndexEntry> = BTreeMap::new();
    for e in entries {
        let key = (e.name.to_lowercase(), e.major, e.minor);
        if let Some(prev) = seen.insert(key, e) {
            return Err(namespace_error(
                &e.source,
                format!("{} {}.{} is also defined in {}", e.name, e.major, e.minor, prev.source.display()),
            ));
        }
    }
    let mut ports: BTreeMap<(bool, u16), &IndexEntry> = BTreeMap::new();
    for e in entries {
        let Some(port) = e.fixed_port_id else { continue };
        let root = e.name.split('.').next().unwrap_or_default();
        if !allow_unregulated_fixed_port_id && !is_regulated_port_id(root, e.kind, port) {
            return Err(namespace_error(
                &e.source,
                format!("fixed port-ID {port} is not in the regulated range of {root:?}"),
            ));
        }
        let key = (e.kind == EntryKind::Service, port);
        match ports.get(&key) {
            Some(other) if other.name != e.name || other.major != e.major => {
                return Err(namespace_error(
                    &e.source,
                    format!("fixed port-ID {port} is also used by {} {}.{}", other.name, other.major, other.minor),
                ));
            }
            Some(_) => {}
            None => {
                let _ = ports.insert(key, e);
            }
        }
    }
    Ok(())
}

/// Summary of one compiled namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledNamespace {
    /// Root namespace name.
    pub root: String,
    /// Directory holding the written index.
    pub output_dir: PathBuf,
    /// Number of definitions.
    pub type_count: usize,
}

/// Validates `sources` together with `lookup` and writes an index per source namespace.
///
/// # Errors
///
/// Returns the first validation or I/O error; nothing is written in that case.
pub fn compile(
    sources: &[PathBuf],
    lookup: &[PathBuf],
    output: &Path,
    allow_unregulated_fixed_port_id: bool,
) -> Result<Vec<CompiledNamespace>> {
    let mut scanned: Vec<(PathBuf, Vec<IndexEntry>, String)> = Vec::new();
    let mut lookup_entries: Vec<IndexEntry> = Vec::new();
    for dir in sources {
        if dir
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'))
        {
            tracing::debug!(path = %dir.display(), "skipping hidden directory");
            continue;
        }
        let (entries, digest) = scan_root_namespace(dir)?;
        scanned.push((dir.clone(), entries, digest));
    }
    for dir in lookup {
        if sources.contains(dir) {
            continue;
        }
        lookup_entries.extend(scan_root_namespace(dir)?.0);
    }
    let all: Vec<&IndexEntry> = scanned
        .iter()
        .flat_map(|(_, e, _)| e.iter())
        .chain(lookup_entries.iter())
        .collect();
    validate(&all, allow_unregulated_fixed_port_id)?;

    let mut out = Vec::new();
    for (dir, entries, digest) in scanned {
        let root = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_owned();
        let dest = output.join(&root);
        std::fs::create_dir_all(&dest).map_err(|source| DsdlError::Io {
            path: dest.clone(),
            source,
        })?;
        let index = NamespaceIndex {
            root: root.clone(),
            source_dir: dir,
            digest,
            entries,
        };
        let path = dest.join(INDEX_FILE_NAME);
        std::fs::write(&path, serde_json::to_string_pretty(&index)?).map_err(|source| DsdlError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::info!(root = %root, types = index.entries.len(), path = %path.display(), "namespace index written");
        out.push(CompiledNamespace {
            root,
            output_dir: dest,
            type_count: index.entries.len(),
        });
    }
    Ok(out)
}
