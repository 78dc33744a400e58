//! The driver registry.
//!
//! Maps schemes to drivers and file name extensions to schemes. The
//! extension table is what turns `archive.tar.gz/x` into a `targz` mount:
//! detection picks the longest registered suffix, so `tar.gz` wins over a
//! hypothetical `gz` registration.

use std::collections::HashMap;
use std::sync::Arc;

use crate::addr::Scheme;
use crate::driver::{ArchiveDriver, HostDriver};
use crate::drivers::file::FileDriver;
use crate::error::{FsError, FsResult};

/// The canonical scheme-to-extension table of the well-known archive
/// families. Drivers for these formats are registered by the embedder; the
/// table itself ships with the kernel so that path detection agrees across
/// deployments.
pub fn default_scheme_extensions() -> &'static [(&'static str, &'static [&'static str])] {
    &[
        ("zip", &["zip"]),
        ("jar", &["jar", "war", "ear"]),
        (
            "odf",
            &[
                "odt", "ott", "odg", "otg", "odp", "otp", "ods", "ots", "odc", "otc", "odi",
                "oti", "odf", "otf", "odm", "oth", "odb",
            ],
        ),
        ("exe", &["exe"]),
        ("tar", &["tar"]),
        ("targz", &["tgz", "tar.gz"]),
        ("tarbz2", &["tbz", "tb2", "tar.bz2"]),
        ("tarxz", &["tar.xz"]),
        ("tzp", &["tzp"]),
    ]
}

/// Scheme-to-driver and extension-to-scheme mappings.
pub struct DriverRegistry {
    archives: HashMap<Scheme, Arc<dyn ArchiveDriver>>,
    hosts: HashMap<Scheme, Arc<dyn HostDriver>>,
    extensions: Vec<(String, Scheme)>,
}

impl DriverRegistry {
    /// A registry with the `file` host driver preinstalled and no archive
    /// drivers.
    pub fn new() -> DriverRegistry {
        let mut registry = DriverRegistry {
            archives: HashMap::new(),
            hosts: HashMap::new(),
            extensions: Vec::new(),
        };
        registry.register_host(Scheme::new("file").expect("valid scheme"), Arc::new(FileDriver));
        registry
    }

    /// Register an archive driver for a scheme together with the file name
    /// extensions it claims.
    pub fn register_archive(
        &mut self,
        scheme: Scheme,
        extensions: &[&str],
        driver: Arc<dyn ArchiveDriver>,
    ) {
        for ext in extensions {
            self.extensions
                .push((ext.to_ascii_lowercase(), scheme.clone()));
        }
        // Longest suffix first, so composite extensions win detection.
        self.extensions
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        self.archives.insert(scheme, driver);
    }

    /// Register a host file system driver for a scheme.
    pub fn register_host(&mut self, scheme: Scheme, driver: Arc<dyn HostDriver>) {
        self.hosts.insert(scheme, driver);
    }

    /// The archive driver for a scheme.
    pub fn archive_driver(&self, scheme: &Scheme) -> FsResult<&Arc<dyn ArchiveDriver>> {
        self.archives
            .get(scheme)
            .ok_or_else(|| FsError::MalformedUri(format!("no archive driver for scheme {scheme}")))
    }

    /// The host driver for a scheme.
    pub fn host_driver(&self, scheme: &Scheme) -> FsResult<&Arc<dyn HostDriver>> {
        self.hosts
            .get(scheme)
            .ok_or_else(|| FsError::MalformedUri(format!("no host driver for scheme {scheme}")))
    }

    /// Detect the archive scheme for a file name by its longest registered
    /// extension, if any.
    pub fn scheme_for_name(&self, file_name: &str) -> Option<&Scheme> {
        let lower = file_name.to_ascii_lowercase();
        self.extensions.iter().find_map(|(ext, scheme)| {
            lower
                .strip_suffix(ext)
                .filter(|prefix| prefix.ends_with('.'))
                .map(|_| scheme)
        })
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        DriverRegistry::new()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("archives", &self.archives.keys().collect::<Vec<_>>())
            .field("hosts", &self.hosts.keys().collect::<Vec<_>>())
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::drivers::sar::SarDriver;

    fn sample() -> DriverRegistry {
        let mut registry = DriverRegistry::new();
        registry.register_archive(
            Scheme::new("sar").unwrap(),
            &["sar"],
            Arc::new(SarDriver::new()),
        );
        registry.register_archive(
            Scheme::new("targz").unwrap(),
            &["tgz", "tar.gz"],
            Arc::new(SarDriver::new()),
        );
        registry
    }

    #[test]
    fn longest_extension_wins() {
        let registry = sample();
        assert_eq!(
            registry.scheme_for_name("a.tar.gz").unwrap().as_str(),
            "targz"
        );
        assert_eq!(registry.scheme_for_name("b.sar").unwrap().as_str(), "sar");
        assert!(registry.scheme_for_name("c.txt").is_none());
        // The extension must be a suffix component, not a substring.
        assert!(registry.scheme_for_name("notasar").is_none());
    }

    #[test]
    fn host_driver_is_preinstalled() {
        let registry = DriverRegistry::new();
        assert!(registry.host_driver(&Scheme::new("file").unwrap()).is_ok());
        assert!(registry
            .archive_driver(&Scheme::new("zip").unwrap())
            .is_err());
    }

    #[test]
    fn default_table_covers_the_known_families() {
        let table = default_scheme_extensions();
        assert!(table.iter().any(|(s, _)| *s == "targz"));
        let odf = table.iter().find(|(s, _)| *s == "odf").unwrap();
        assert_eq!(odf.1.len(), 17);
    }
}
