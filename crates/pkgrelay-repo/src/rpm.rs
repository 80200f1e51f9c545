//! Yum-style repository layout.
//!
//! ```text
//! <root>/Packages/<file>.rpm
//! <root>/repodata/repomd.xml
//! <root>/repodata/packages/<name>-<version>-<release>.<arch>.xml
//! ```

use pkgrelay_core::artifact::sha256_bytes;
use pkgrelay_core::{Artifact, PackageType};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{RepoError, RepoResult};
use crate::generator::{FileDigest, control_fields, reset_dir};
use crate::tooling::IndexTooling;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Nevra {
    name: String,
    version: String,
    release: String,
    arch: String,
}

impl Nevra {
    fn metadata_name(&self) -> String {
        format!(
            "{}-{}-{}.{}.xml",
            self.name, self.version, self.release, self.arch
        )
    }
}

/// `name-version-release.arch.rpm` split into its parts.
fn parse_file_name(file_name: &str) -> Option<Nevra> {
    let stem = file_name.strip_suffix(".rpm")?;
    let (rest, arch) = stem.rsplit_once('.')?;
    let (rest, release) = rest.rsplit_once('-')?;
    let (name, version) = rest.rsplit_once('-')?;
    if [name, version, release, arch].iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(Nevra {
        name: name.to_string(),
        version: version.to_string(),
        release: release.to_string(),
        arch: arch.to_string(),
    })
}

type XmlWriter = Writer<Vec<u8>>;

fn xml_error(e: impl std::fmt::Display) -> RepoError {
    RepoError::Io(std::io::Error::other(e.to_string()))
}

fn new_document() -> RepoResult<XmlWriter> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;
    Ok(writer)
}

fn finish_document(writer: XmlWriter) -> RepoResult<String> {
    let mut out = String::from_utf8(writer.into_inner()).map_err(xml_error)?;
    out.push('\n');
    Ok(out)
}

fn open(writer: &mut XmlWriter, name: &str, attrs: &[(&str, &str)]) -> RepoResult<()> {
    let start = BytesStart::new(name).with_attributes(attrs.iter().copied());
    writer.write_event(Event::Start(start)).map_err(xml_error)
}

fn close(writer: &mut XmlWriter, name: &str) -> RepoResult<()> {
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_error)
}

fn empty(writer: &mut XmlWriter, name: &str, attrs: &[(&str, &str)]) -> RepoResult<()> {
    let start = BytesStart::new(name).with_attributes(attrs.iter().copied());
    writer.write_event(Event::Empty(start)).map_err(xml_error)
}

fn text(writer: &mut XmlWriter, name: &str, attrs: &[(&str, &str)], value: &str) -> RepoResult<()> {
    open(writer, name, attrs)?;
    writer
        .write_event(Event::Text(BytesText::new(value)))
        .map_err(xml_error)?;
    close(writer, name)
}

fn render_package(
    nevra: &Nevra,
    summary: Option<&str>,
    href: &str,
    digest: &FileDigest,
) -> RepoResult<String> {
    let size = digest.size.to_string();
    let mut w = new_document()?;
    open(&mut w, "package", &[("type", "rpm")])?;
    text(&mut w, "name", &[], &nevra.name)?;
    text(&mut w, "arch", &[], &nevra.arch)?;
    empty(
        &mut w,
        "version",
        &[("ver", nevra.version.as_str()), ("rel", nevra.release.as_str())],
    )?;
    text(&mut w, "checksum", &[("type", "sha256")], &digest.sha256)?;
    if let Some(summary) = summary {
        text(&mut w, "summary", &[], summary)?;
    }
    empty(&mut w, "size", &[("package", size.as_str())])?;
    empty(&mut w, "location", &[("href", href)])?;
    close(&mut w, "package")?;
    finish_document(w)
}

fn render_repomd(entries: &BTreeMap<String, (String, FileDigest)>) -> RepoResult<String> {
    let revision = sha256_bytes(
        entries
            .iter()
            .map(|(href, (_, digest))| format!("{} {}\n", href, digest.sha256))
            .collect::<String>()
            .as_bytes(),
    );

    let mut w = new_document()?;
    open(&mut w, "repomd", &[])?;
    text(&mut w, "revision", &[], &revision)?;
    for (href, (name, digest)) in entries {
        open(&mut w, "data", &[("type", "package"), ("name", name.as_str())])?;
        text(&mut w, "checksum", &[("type", "sha256")], &digest.sha256)?;
        empty(&mut w, "location", &[("href", href.as_str())])?;
        text(&mut w, "size", &[], &digest.size.to_string())?;
        close(&mut w, "data")?;
    }
    close(&mut w, "repomd")?;
    finish_document(w)
}

/// Write the yum tree for `artifacts` under `root`, returning the index
/// files relative to `root`.
pub(crate) async fn generate(
    tooling: &dyn IndexTooling,
    artifacts: &[&Artifact],
    root: &Path,
) -> RepoResult<Vec<PathBuf>> {
    let packages_dir = root.join("Packages");
    let repodata = root.join("repodata");
    reset_dir(&packages_dir).await?;
    reset_dir(&repodata).await?;
    tokio::fs::create_dir_all(repodata.join("packages")).await?;

    // href of the metadata file -> (package name, digest of the metadata file)
    let mut entries: BTreeMap<String, (String, FileDigest)> = BTreeMap::new();
    let mut providers: BTreeMap<String, String> = BTreeMap::new();

    for artifact in artifacts {
        let file_name = artifact.file_name();
        let pooled = packages_dir.join(&file_name);
        tokio::fs::copy(&artifact.file_path, &pooled).await?;
        let data = tokio::fs::read(&pooled).await?;

        let mut nevra = parse_file_name(&file_name).unwrap_or_else(|| Nevra {
            name: artifact.component_name.clone(),
            version: artifact.resolved_version.clone(),
            release: "0".to_string(),
            arch: "noarch".to_string(),
        });
        let fields = control_fields(tooling, PackageType::Rpm, &pooled).await?;
        for (key, slot) in [
            ("Name", &mut nevra.name),
            ("Version", &mut nevra.version),
            ("Release", &mut nevra.release),
            ("Arch", &mut nevra.arch),
        ] {
            if let Some(value) = fields.get(key) {
                *slot = value.clone();
            }
        }

        let href = format!("repodata/packages/{}", nevra.metadata_name());
        if let Some(previous) = providers.insert(href.clone(), file_name.clone()) {
            return Err(RepoError::InvalidPackage {
                file: file_name,
                message: format!(
                    "{}-{}-{}.{} is also provided by {}",
                    nevra.name, nevra.version, nevra.release, nevra.arch, previous
                ),
            });
        }
        let xml = render_package(
            &nevra,
            fields.get("Summary").map(String::as_str),
            &format!("Packages/{}", file_name),
            &FileDigest::of(&data),
        )?;
        tokio::fs::write(root.join(&href), &xml).await?;
        debug!(href = %href, "Wrote package metadata");

        entries.insert(href, (nevra.name.clone(), FileDigest::of(xml.as_bytes())));
    }

    tokio::fs::write(repodata.join("repomd.xml"), render_repomd(&entries)?).await?;

    let mut index_files: Vec<PathBuf> = entries.keys().map(PathBuf::from).collect();
    index_files.push(PathBuf::from("repodata/repomd.xml"));
    index_files.sort();
    Ok(index_files)
}
