//! Data type name parsing and lookup.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::catalog::Catalog;
use crate::error::{DsdlError, Result};
use crate::index::{NamespaceIndex, load_indexes, make_usage_suggestion};
use crate::schema::DataType;

#[allow(clippy::expect_used)] // literal patterns, compiled in tests
static RE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([a-zA-Z_][a-zA-Z0-9_]*(?:[./\\][a-zA-Z_][a-zA-Z0-9_]*)+)(?:[./\\](\d+))?(?:[./\\](\d+))?$",
    )
    .expect("pattern is valid")
});

/// A parsed `full.name[.major[.minor]]` reference.
///
/// Name separators may also be `/` or `\`, so file system paths work too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeName {
    /// Namespace components.
    pub namespace: Vec<String>,
    /// Short name as written by the user.
    pub short_name: String,
    /// Requested major version.
    pub major: Option<u8>,
    /// Requested minor version.
    pub minor: Option<u8>,
}

impl TypeName {
    /// Dotted namespace.
    #[must_use]
    pub fn namespace_str(&self) -> String {
        self.namespace.join(".")
    }

    /// Root namespace.
    #[must_use]
    pub fn root_namespace(&self) -> &str {
        self.namespace.first().map_or("", String::as_str)
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = |x: Option<u8>| x.map_or_else(|| "*".to_owned(), |n| n.to_string());
        write!(
            f,
            "{}.{}.{}.{}",
            self.namespace_str(),
            self.short_name,
            v(self.major),
            v(self.minor)
        )
    }
}

impl FromStr for TypeName {
    type Err = DsdlError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DsdlError::InvalidName { name: s.to_owned() };
        let caps = RE_NAME.captures(s).ok_or_else(invalid)?;
        let full = caps.get(1).ok_or_else(invalid)?.as_str();
        let mut components: Vec<String> = full
            .split(['.', '/', '\\'])
            .map(str::to_owned)
            .collect();
        let short_name = components.pop().ok_or_else(invalid)?;
        let version = |i: usize| -> Result<Option<u8>> {
            caps.get(i)
                .map(|m| m.as_str().parse::<u8>().map_err(|_| invalid()))
                .transpose()
        };
        Ok(Self {
            namespace: components,
            short_name,
            major: version(2)?,
            minor: version(3)?,
        })
    }
}

/// Resolves type names against the built-in catalog and compiled namespace indexes.
#[derive(Debug)]
pub struct Loader {
    catalog: &'static Catalog,
    indexes: Vec<NamespaceIndex>,
}

impl Default for Loader {
    fn default() -> Self {
        Self {
            catalog: Catalog::standard(),
            indexes: Vec::new(),
        }
    }
}

impl Loader {
    /// Creates a loader that also consults the indexes found under `lookup_dirs`.
    #[must_use]
    pub fn new(lookup_dirs: &[PathBuf]) -> Self {
        let indexes = load_indexes(lookup_dirs);
        tracing::debug!(indexes = indexes.len(), "namespace indexes loaded");
        Self {
            catalog: Catalog::standard(),
            indexes,
        }
    }

    /// The catalog used for codecs.
    #[must_use]
    pub const fn catalog(&self) -> &'static Catalog {
        self.catalog
    }

    /// Loads a type by name. Missing versions resolve to the newest available.
    /// With `allow_minor_version_mismatch`, a missing minor version falls back to
    /// the newest minor of the requested major.
    ///
    /// # Errors
    ///
    /// [`DsdlError::InvalidName`] for malformed names, [`DsdlError::NoCodec`]
    /// for types known only from a compiled index, and
    /// [`DsdlError::UnknownType`] otherwise.
    pub fn load(&self, name: &str, allow_minor_version_mismatch: bool) -> Result<Arc<DataType>> {
        let parsed: TypeName = name.parse()?;
        tracing::debug!(name, parsed = %parsed, "loading data type");
        let ns = parsed.namespace_str();
        let found = self
            .catalog
            .find(&ns, &parsed.short_name, parsed.major, parsed.minor)
            .or_else(|| {
                (allow_minor_version_mismatch && parsed.minor.is_some())
                    .then(|| self.catalog.find(&ns, &parsed.short_name, parsed.major, None))
                    .flatten()
            });
        if let Some(dt) = found {
            return Ok(dt);
        }
        let minor = if allow_minor_version_mismatch { None } else { parsed.minor };
        if let Some(entry) = self
            .indexes
            .iter()
            .find_map(|ix| ix.find(&ns, &parsed.short_name, parsed.major, minor))
        {
            return Err(DsdlError::NoCodec {
                name: format!("{}.{}.{}", entry.name, entry.major, entry.minor),
            });
        }
        let known_namespace = self.catalog.has_namespace(&ns)
            || self.indexes.iter().any(|ix| ix.entries.iter().any(|e| e.namespace() == ns));
        let suggestion = if known_namespace {
            format!("No such type in namespace {ns:?}.")
        } else {
            make_usage_suggestion(Some(parsed.root_namespace()))
        };
        Err(DsdlError::UnknownType {
            name: parsed.to_string(),
            suggestion,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_spellings() {
        let n: TypeName = "uavcan.node.Heartbeat.1.0".parse().expect("parse");
        assert_eq!(n.namespace, vec!["uavcan", "node"]);
        assert_eq!((n.short_name.as_str(), n.major, n.minor), ("Heartbeat", Some(1), Some(0)));
        let n: TypeName = "uavcan/node\\Heartbeat/1\\0".parse().expect("parse");
        assert_eq!((n.major, n.minor), (Some(1), Some(0)));
        let n: TypeName = "uavcan.node.Heartbeat.1".parse().expect("parse");
        assert_eq!((n.major, n.minor), (Some(1), None));
        let n: TypeName = "uavcan.Heartbeat".parse().expect("parse");
        assert_eq!(n.namespace, vec!["uavcan"]);
    }

    #[test]
    fn rejects_malformed_names() {
        assert!("uavcan.node.Heartbeat.1.1.0".parse::<TypeName>().is_err());
        assert!("uavcan".parse::<TypeName>().is_err());
        assert!("uavcan.node.Heartbeat.1.999".parse::<TypeName>().is_err());
    }

    #[test]
    fn short_name_is_case_insensitive_and_newest_wins() {
        let loader = Loader::default();
        let dt = loader.load("uavcan.node.HEARTBEAT", false).expect("load");
        assert_eq!(dt.full_name(), "uavcan.node.Heartbeat.1.0");
        let dt = loader.load("uavcan/node/executecommand", false).expect("load");
        assert_eq!(dt.full_name(), "uavcan.node.ExecuteCommand.1.1");
    }

    #[test]
    fn minor_mismatch_falls_back_when_allowed() {
        let loader = Loader::default();
        assert!(loader.load("uavcan.node.Heartbeat.1.7", false).is_err());
        let dt = loader.load("uavcan.node.Heartbeat.1.7", true).expect("load");
        assert_eq!(dt.version().minor, 0);
        assert!(loader.load("uavcan.node.Heartbeat.2.0", true).is_err());
    }

    #[test]
    fn unknown_namespace_suggests_compiling() {
        let err = Loader::default().load("sirius.cyber.Corp.1.0", false).expect_err("unknown");
        let text = err.to_string();
        assert!(text.contains("sirius.cyber.Corp.1.0"), "{text}");
        assert!(text.contains("yakut compile <path>/sirius"), "{text}");
    }

    #[test]
    fn indexed_type_without_codec_is_reported() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ns = tmp.path().join("src").join("sirius");
        std::fs::create_dir_all(&ns).expect("mkdir");
        std::fs::write(ns.join("Corp.1.0.dsdl"), "@sealed\n").expect("write");
        let out = tmp.path().join("out");
        let _ = crate::index::compile(std::slice::from_ref(&ns), &[], &out, false).expect("compile");
        let loader = Loader::new(&[out]);
        assert!(matches!(
            loader.load("sirius.corp", false),
            Err(DsdlError::NoCodec { ref name }) if name == "sirius.Corp.1.0"
        ));
        let err = loader.load("sirius.Missing", false).expect_err("missing");
        assert!(err.to_string().contains("No such type"));
    }

    #[test]
    fn patterns_compile() {
        let _ = LazyLock::force(&RE_NAME);
    }
}
