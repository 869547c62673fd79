//! Package-file selection and ingestion.
//!
//! The harvester decides which files inside an extracted layer matter for
//! vulnerability matching. The fixed path sets live here, together with the
//! seams (`PackageIngest`, `AppScanner`) behind which the real OS and
//! ecosystem parsers sit. The default implementations normalize DPKG
//! status files and recognize common application manifests; deep parsing
//! belongs to the downstream analyzers.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// OS package databases and release files harvested from every layer.
pub const OS_PKG_FILES: &[&str] = &[
    "var/lib/dpkg/status",
    "var/lib/rpm/Packages",
    "var/lib/rpm/Packages.db",
    "var/lib/rpm/rpmdb.sqlite",
    "usr/lib/sysimage/rpm/Packages",
    "usr/lib/sysimage/rpm/Packages.db",
    "usr/lib/sysimage/rpm/rpmdb.sqlite",
    "lib/apk/db/installed",
    "etc/os-release",
    "usr/lib/os-release",
    "etc/lsb-release",
    "etc/alpine-release",
    "etc/centos-release",
    "etc/redhat-release",
];

/// RPM database files that go through the RPM ingester.
pub const RPM_PKG_FILES: &[&str] = &[
    "var/lib/rpm/Packages",
    "var/lib/rpm/Packages.db",
    "var/lib/rpm/rpmdb.sqlite",
    "usr/lib/sysimage/rpm/Packages",
    "usr/lib/sysimage/rpm/Packages.db",
    "usr/lib/sysimage/rpm/rpmdb.sqlite",
];

/// Canonical DPKG status file.
pub const DPKG_STATUS: &str = "var/lib/dpkg/status";

/// Distroless images split the status file into per-package fragments.
pub const DPKG_STATUS_DIR: &str = "var/lib/dpkg/status.d/";

/// Red Hat content manifests carrying source RPM provenance.
pub const CONTENT_MANIFEST_DIR: &str = "root/buildinfo/content_manifests";

/// Build-info Dockerfiles embedded in UBI-based images.
pub const DOCKERFILE_PREFIX: &str = "root/buildinfo/Dockerfile-";

pub fn is_os_pkg_file(rel_path: &str) -> bool {
    OS_PKG_FILES.contains(&rel_path)
}

pub fn is_rpm_pkg_file(rel_path: &str) -> bool {
    RPM_PKG_FILES.contains(&rel_path)
}

/// One application-level package discovered in a layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppPackage {
    /// Ecosystem label (e.g. "nodejs", "python", "jar")
    pub app_name: String,
    /// Package or module name
    pub module_name: String,
    pub version: String,
    /// Layer-relative path of the manifest the package came from
    pub file_name: String,
}

/// Normalizes OS package databases into the byte form downstream
/// matching expects.
pub trait PackageIngest: Send + Sync {
    fn rpm_packages(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn dpkg_status(&self, path: &Path) -> io::Result<Vec<u8>>;
}

/// Recognizes and parses application package manifests per ecosystem.
pub trait AppScanner: Send + Sync {
    fn is_app_pkg_file(&self, rel_path: &str, full_path: &Path) -> bool;

    /// Parse the manifest into structured packages. `None` means the file
    /// could not be parsed and is omitted from the harvest.
    fn extract(&self, rel_path: &str, full_path: &Path) -> Option<Vec<AppPackage>>;
}

/// Pass-through OS ingester: RPM databases are forwarded verbatim for the
/// external RPM parser, DPKG status files are reduced to the stanza lines
/// the matcher consumes.
#[derive(Debug, Default)]
pub struct RawPackageIngest;

const DPKG_KEEP_PREFIXES: &[&str] = &[
    "Package:",
    "Status:",
    "Source:",
    "Version:",
    "Architecture:",
];

impl PackageIngest for RawPackageIngest {
    fn rpm_packages(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn dpkg_status(&self, path: &Path) -> io::Result<Vec<u8>> {
        let content = std::fs::read_to_string(path)?;
        let mut out = String::with_capacity(content.len() / 4);
        for line in content.lines() {
            if line.is_empty() || DPKG_KEEP_PREFIXES.iter().any(|p| line.starts_with(p)) {
                out.push_str(line);
                out.push('\n');
            }
        }
        Ok(out.into_bytes())
    }
}

/// Default application scanner keyed on well-known manifest names.
#[derive(Debug, Default)]
pub struct ManifestNameScanner;

impl ManifestNameScanner {
    fn base_name(rel_path: &str) -> &str {
        rel_path.rsplit('/').next().unwrap_or(rel_path)
    }

    fn node_package(rel_path: &str, full_path: &Path) -> Option<Vec<AppPackage>> {
        #[derive(Deserialize)]
        struct NodePackage {
            name: String,
            version: String,
        }

        let data = std::fs::read(full_path).ok()?;
        let parsed: NodePackage = serde_json::from_slice(&data).ok()?;
        Some(vec![AppPackage {
            app_name: "nodejs".to_string(),
            module_name: parsed.name,
            version: parsed.version,
            file_name: rel_path.to_string(),
        }])
    }

    fn python_metadata(rel_path: &str, full_path: &Path) -> Option<Vec<AppPackage>> {
        let content = std::fs::read_to_string(full_path).ok()?;
        let mut name = None;
        let mut version = None;
        for line in content.lines() {
            if let Some(v) = line.strip_prefix("Name: ") {
                name = Some(v.trim().to_string());
            } else if let Some(v) = line.strip_prefix("Version: ") {
                version = Some(v.trim().to_string());
            }
            if name.is_some() && version.is_some() {
                break;
            }
        }
        Some(vec![AppPackage {
            app_name: "python".to_string(),
            module_name: name?,
            version: version?,
            file_name: rel_path.to_string(),
        }])
    }

    fn jar_archive(rel_path: &str) -> Option<Vec<AppPackage>> {
        // derive "name" and "version" from the common name-1.2.3.jar shape
        let base = Self::base_name(rel_path);
        let stem = base.strip_suffix(".jar").or_else(|| base.strip_suffix(".war"))?;
        let (module, version) = match stem.rfind('-') {
            Some(idx) if stem[idx + 1..].starts_with(|c: char| c.is_ascii_digit()) => {
                (&stem[..idx], &stem[idx + 1..])
            }
            _ => (stem, ""),
        };
        Some(vec![AppPackage {
            app_name: "jar".to_string(),
            module_name: module.to_string(),
            version: version.to_string(),
            file_name: rel_path.to_string(),
        }])
    }
}

impl AppScanner for ManifestNameScanner {
    fn is_app_pkg_file(&self, rel_path: &str, _full_path: &Path) -> bool {
        let base = Self::base_name(rel_path);
        base == "package.json"
            || base.ends_with(".jar")
            || base.ends_with(".war")
            || (base == "METADATA" && rel_path.contains(".dist-info/"))
            || (base == "PKG-INFO" && rel_path.contains(".egg-info"))
    }

    fn extract(&self, rel_path: &str, full_path: &Path) -> Option<Vec<AppPackage>> {
        let base = Self::base_name(rel_path);
        if base == "package.json" {
            Self::node_package(rel_path, full_path)
        } else if base == "METADATA" || base == "PKG-INFO" {
            Self::python_metadata(rel_path, full_path)
        } else if base.ends_with(".jar") || base.ends_with(".war") {
            Self::jar_archive(rel_path)
        } else {
            None
        }
    }
}
