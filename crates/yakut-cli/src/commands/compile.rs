//! `yakut compile` — Index DSDL root namespaces so other commands can use
//! their types.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::Args;
use tempfile::TempDir;
use yakut_common::constants::DEFAULT_PUBLIC_REGULATED_DATA_TYPES_ARCHIVE_URI;
use yakut_dsdl::index::{compile, is_valid_root_namespace_name};

use crate::context::Context;

/// Arguments for the `compile` command.
#[derive(Args, Debug)]
#[command(after_help = format!(
    "Example:\n    yakut compile ~/namespace --lookup {DEFAULT_PUBLIC_REGULATED_DATA_TYPES_ARCHIVE_URI}"
))]
pub struct CompileArgs {
    /// Root namespace directories, local archives, or archive URIs whose
    /// top level holds root namespace directories.
    #[arg(required = true, value_name = "SOURCE")]
    pub source: Vec<String>,

    /// Like SOURCE, but only used to look up dependencies.
    #[arg(long, short = 'L', value_name = "SOURCE")]
    pub lookup: Vec<String>,

    /// Directory where the indexes are written; defaults to the current
    /// directory. Existing indexes are replaced.
    #[arg(long, short = 'O')]
    pub output: Option<PathBuf>,

    /// Accept unregulated data types with fixed port identifiers.
    #[arg(long)]
    pub allow_unregulated_fixed_port_id: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
}

impl ArchiveKind {
    fn of(location: &str) -> Option<Self> {
        let lower = location.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

/// Keeps the extracted archives alive until compilation is over.
#[derive(Default)]
struct Fetcher {
    scratch: Vec<TempDir>,
}

impl Fetcher {
    fn root_namespace_dirs(&mut self, location: &str) -> anyhow::Result<Vec<PathBuf>> {
        if location.contains("://") {
            let dir = self.download(location)?;
            let dirs = namespace_dirs_in(&dir)?;
            tracing::info!(location, dirs = ?dirs, "resource contains root namespaces");
            return Ok(dirs);
        }
        let path = Path::new(location);
        match ArchiveKind::of(location) {
            Some(kind) if path.is_file() => {
                let scratch = self.scratch_dir()?;
                unpack(path, kind, &scratch)?;
                namespace_dirs_in(&scratch)
            }
            _ => Ok(vec![path.to_path_buf()]),
        }
    }

    fn scratch_dir(&mut self) -> anyhow::Result<PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix("yakut-dsdl-")
            .tempdir()
            .context("cannot create a temporary directory")?;
        let path = dir.path().to_path_buf();
        self.scratch.push(dir);
        Ok(path)
    }

    fn download(&mut self, uri: &str) -> anyhow::Result<PathBuf> {
        let scratch = self.scratch_dir()?;
        let kind = ArchiveKind::of(uri).unwrap_or(ArchiveKind::Zip);
        let file = scratch.join(match kind {
            ArchiveKind::Zip => "dsdl.zip",
            ArchiveKind::TarGz => "dsdl.tar.gz",
            ArchiveKind::Tar => "dsdl.tar",
        });
        tracing::info!(uri, file = %file.display(), "downloading archive");
        let response = reqwest::blocking::get(uri).with_context(|| format!("failed to download {uri}"))?;
        if !response.status().is_success() {
            anyhow::bail!("Could not download the archive; HTTP error {}", response.status());
        }
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read response body from {uri}"))?;
        std::fs::write(&file, &bytes).with_context(|| format!("cannot write {}", file.display()))?;
        let extracted = scratch.join("extracted");
        unpack(&file, kind, &extracted)?;
        Ok(extracted)
    }
}

fn unpack(archive: &Path, kind: ArchiveKind, target: &Path) -> anyhow::Result<()> {
    tracing::info!(archive = %archive.display(), target = %target.display(), ?kind, "extracting archive");
    std::fs::create_dir_all(target).with_context(|| format!("cannot create {}", target.display()))?;
    let file = File::open(archive).with_context(|| format!("cannot open {}", archive.display()))?;
    match kind {
        ArchiveKind::Zip => zip::ZipArchive::new(file)
            .and_then(|mut z| z.extract(target))
            .with_context(|| format!("cannot extract {}", archive.display()))?,
        ArchiveKind::TarGz => tar::Archive::new(flate2::read::GzDecoder::new(file))
            .unpack(target)
            .with_context(|| format!("cannot extract {}", archive.display()))?,
        ArchiveKind::Tar => tar::Archive::new(file)
            .unpack(target)
            .with_context(|| format!("cannot extract {}", archive.display()))?,
    }
    Ok(())
}

fn subdirs(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut out: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot list {}", dir.display()))?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    out.sort();
    Ok(out)
}

/// Root namespace directories of an extracted archive. A single enclosing
/// directory, as found in repository snapshots, is stripped first.
fn namespace_dirs_in(extracted: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let top = subdirs(extracted)?;
    let inner = match top.as_slice() {
        [single] => single.clone(),
        _ => extracted.to_path_buf(),
    };
    Ok(subdirs(&inner)?
        .into_iter()
        .filter(|d| {
            d.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(is_valid_root_namespace_name)
        })
        .collect())
}

/// Executes the `compile` command.
///
/// # Errors
///
/// Returns an error if a source cannot be fetched or the namespaces are invalid.
pub fn execute(args: CompileArgs, _ctx: &Context) -> anyhow::Result<()> {
    let output = match args.output {
        Some(p) => p,
        None => std::env::current_dir().context("cannot determine the working directory")?,
    };
    tracing::info!(output = %output.display(), "destination");
    let mut fetcher = Fetcher::default();
    let mut sources = Vec::new();
    for location in &args.source {
        sources.extend(fetcher.root_namespace_dirs(location)?);
    }
    let mut lookup = Vec::new();
    for location in &args.lookup {
        lookup.extend(fetcher.root_namespace_dirs(location)?);
    }
    tracing::info!(sources = ?sources, lookup = ?lookup, "namespace directories");
    lookup.extend(sources.iter().cloned());
    let compiled = compile(&sources, &lookup, &output, args.allow_unregulated_fixed_port_id)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    for ns in &compiled {
        tracing::info!(
            root = %ns.root,
            types = ns.type_count,
            path = %ns.output_dir.display(),
            "namespace compiled"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_kinds_follow_extensions() {
        assert_eq!(ArchiveKind::of("https://x/y/master.ZIP"), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::of("ns.tar.gz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::of("ns.tgz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::of("ns.tar"), Some(ArchiveKind::Tar));
        assert_eq!(ArchiveKind::of("some/dir"), None);
    }

    #[test]
    fn snapshot_wrapper_directory_is_stripped() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let inner = tmp.path().join("public_regulated_data_types-master");
        for d in ["uavcan", "reg", ".github", "1bad"] {
            std::fs::create_dir_all(inner.join(d)).expect("mkdir");
        }
        std::fs::write(inner.join("README.md"), "x").expect("write");
        let dirs = namespace_dirs_in(tmp.path()).expect("dirs");
        assert_eq!(dirs, vec![inner.join("reg"), inner.join("uavcan")]);
    }

    #[test]
    fn tar_archives_are_unpacked_locally() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let archive = tmp.path().join("ns.tar.gz");
        {
            let file = File::create(&archive).expect("create");
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let data = b"uint8 x\n@sealed\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "wrap/demo/Thing.1.0.dsdl", &data[..])
                .expect("append");
            builder.into_inner().expect("finish").finish().expect("gzip");
        }
        let mut fetcher = Fetcher::default();
        let dirs = fetcher
            .root_namespace_dirs(archive.to_str().expect("utf-8"))
            .expect("fetch");
        assert_eq!(dirs.len(), 1);
        assert!(dirs[0].ends_with("wrap/demo"));
        assert!(dirs[0].join("Thing.1.0.dsdl").is_file());
    }
}
