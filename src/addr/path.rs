//! Paths: a mount point plus an entry name.

use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;

use crate::addr::mount_point::split_path;
use crate::addr::{split_scheme, EntryName, MountPoint, SEPARATOR};
use crate::error::{FsError, FsResult};

/// A fully qualified address of one entry in the federation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FsPath {
    mount_point: MountPoint,
    entry: EntryName,
}

impl FsPath {
    /// Pair a mount point with an entry name.
    pub fn new(mount_point: MountPoint, entry: EntryName) -> FsPath {
        FsPath { mount_point, entry }
    }

    /// Parse a path URI.
    ///
    /// Accepts both plain mount point URIs (addressing the root entry) and
    /// URIs whose final component names an entry inside the innermost file
    /// system, e.g. `sar:file:/tmp/a.sar!/dir/x`.
    pub fn parse(uri: &str) -> FsResult<FsPath> {
        if uri.ends_with(SEPARATOR) {
            return Ok(FsPath::new(MountPoint::parse(uri)?, EntryName::root()));
        }
        let (scheme, rest) = split_scheme(uri)?;
        match memchr::memmem::rfind(rest.as_bytes(), SEPARATOR.as_bytes()) {
            Some(i) => {
                // scheme applies to the mount point left of the separator.
                let mount = format!("{scheme}:{}{SEPARATOR}", &rest[..i]);
                let mount_point = MountPoint::parse(&mount)?;
                let entry = EntryName::parse_uri(&rest[i + SEPARATOR.len()..])?;
                Ok(FsPath::new(mount_point, entry))
            }
            None => {
                let (mount_point, entry) = split_path(uri)?;
                Ok(FsPath::new(mount_point, entry))
            }
        }
    }

    /// The mount point of the file system holding the entry.
    pub fn mount_point(&self) -> &MountPoint {
        &self.mount_point
    }

    /// The entry name within that file system.
    pub fn entry_name(&self) -> &EntryName {
        &self.entry
    }

    /// Resolve a relative name against this path's entry name.
    pub fn resolve(&self, relative: &str) -> FsResult<FsPath> {
        Ok(FsPath::new(
            self.mount_point.clone(),
            self.entry.join(relative)?,
        ))
    }

    /// The chain of (mount point, entry name) pairs from the outermost file
    /// system to this path's own.
    ///
    /// For `sar:sar:file:/t/a.sar!/b.sar!/` with entry `c` this yields
    /// `(file:/t/, a.sar)`, `(sar:file:/t/a.sar!/, b.sar)` and finally
    /// `(sar:sar:file:/t/a.sar!/b.sar!/, c)`.
    pub fn decompose(&self) -> SmallVec<[(MountPoint, EntryName); 4]> {
        let mut chain: SmallVec<[(MountPoint, EntryName); 4]> = SmallVec::new();
        chain.push((self.mount_point.clone(), self.entry.clone()));
        let mut current = self.mount_point.clone();
        loop {
            let link = match (current.parent(), current.entry_in_parent()) {
                (Some(parent), Some(entry)) => (parent.clone(), entry.clone()),
                _ => break,
            };
            current = link.0.clone();
            chain.push(link);
        }
        chain.reverse();
        chain
    }

    /// The canonical rendering.
    pub fn render(&self) -> String {
        if self.entry.is_root() {
            return self.mount_point.render().to_string();
        }
        format!("{}{}", self.mount_point.render(), self.entry)
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromStr for FsPath {
    type Err = FsError;

    fn from_str(s: &str) -> FsResult<FsPath> {
        FsPath::parse(s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_entry_inside_archive() {
        let p = FsPath::parse("sar:file:/tmp/a.sar!/dir/x").unwrap();
        assert_eq!(p.mount_point().render(), "sar:file:/tmp/a.sar!/");
        assert_eq!(p.entry_name().as_str(), "dir/x");
        assert_eq!(p.render(), "sar:file:/tmp/a.sar!/dir/x");
    }

    #[test]
    fn parse_root_entry() {
        let p = FsPath::parse("sar:file:/tmp/a.sar!/").unwrap();
        assert!(p.entry_name().is_root());
    }

    #[test]
    fn parse_host_entry() {
        let p = FsPath::parse("file:/tmp/a.sar").unwrap();
        assert_eq!(p.mount_point().render(), "file:/tmp/");
        assert_eq!(p.entry_name().as_str(), "a.sar");
    }

    #[test]
    fn decompose_walks_outermost_first() {
        let p = FsPath::parse("sar:sar:file:/t/a.sar!/b.sar!/c").unwrap();
        let chain = p.decompose();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].0.render(), "file:/t/");
        assert_eq!(chain[0].1.as_str(), "a.sar");
        assert_eq!(chain[1].0.render(), "sar:file:/t/a.sar!/");
        assert_eq!(chain[1].1.as_str(), "b.sar");
        assert_eq!(chain[2].0.render(), "sar:sar:file:/t/a.sar!/b.sar!/");
        assert_eq!(chain[2].1.as_str(), "c");
    }

    #[test]
    fn resolve_joins_names() {
        let p = FsPath::parse("sar:file:/t/a.sar!/d").unwrap();
        assert_eq!(p.resolve("x").unwrap().entry_name().as_str(), "d/x");
    }
}
