//! Mount point URIs.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use memchr::memmem;

use crate::addr::{decode_percent, split_scheme, EntryName, Scheme, SEPARATOR};
use crate::error::{FsError, FsResult};

/// The location of one file system in the federation.
///
/// Either an opaque absolute URI naming a host file system, or the location
/// of an archive entry inside a parent file system. Cloning is cheap; equality
/// and hashing use the canonical rendering.
#[derive(Clone)]
pub struct MountPoint(Arc<Inner>);

struct Inner {
    rendered: String,
    scheme: Scheme,
    kind: Kind,
}

enum Kind {
    Opaque,
    Nested { parent: MountPoint, entry: EntryName },
}

impl MountPoint {
    /// Parse a mount point URI.
    ///
    /// The grammar is `mount := scheme ":" ( path "!/" | "/" opaque )` where
    /// `path` is either an opaque URI whose last segment names the archive,
    /// or itself contains `!/` for deeper nesting. Percent escapes are
    /// decoded and `.`/`..` segments canonicalized.
    pub fn parse(uri: &str) -> FsResult<MountPoint> {
        if let Some(body) = uri.strip_suffix(SEPARATOR) {
            let (scheme, rest) = split_scheme(body)?;
            let (parent, entry) = split_path(rest)?;
            if entry.is_root() {
                return Err(FsError::MalformedUri(format!(
                    "mount point names no archive entry: {uri}"
                )));
            }
            Ok(MountPoint::nested(parent, scheme, entry))
        } else {
            let (scheme, rest) = split_scheme(uri)?;
            if !rest.starts_with('/') {
                return Err(FsError::NonabsoluteUri(uri.to_string()));
            }
            let path = canonicalize_absolute(rest)?;
            Ok(MountPoint(Arc::new(Inner {
                rendered: format!("{scheme}:{path}"),
                scheme,
                kind: Kind::Opaque,
            })))
        }
    }

    /// Compose a nested mount point from its parts.
    pub fn nested(parent: MountPoint, scheme: Scheme, entry: EntryName) -> MountPoint {
        let rendered = format!("{scheme}:{}{entry}{SEPARATOR}", parent.render());
        MountPoint(Arc::new(Inner {
            rendered,
            scheme,
            kind: Kind::Nested { parent, entry },
        }))
    }

    /// The canonical rendering; `parse(render(mp)) == mp`.
    pub fn render(&self) -> &str {
        &self.0.rendered
    }

    /// The scheme selecting the driver for this file system.
    pub fn scheme(&self) -> &Scheme {
        &self.0.scheme
    }

    /// The parent mount point, or `None` for a host file system.
    pub fn parent(&self) -> Option<&MountPoint> {
        match &self.0.kind {
            Kind::Opaque => None,
            Kind::Nested { parent, .. } => Some(parent),
        }
    }

    /// The name of the archive within the parent, or `None` for a host file
    /// system.
    pub fn entry_in_parent(&self) -> Option<&EntryName> {
        match &self.0.kind {
            Kind::Opaque => None,
            Kind::Nested { entry, .. } => Some(entry),
        }
    }

    /// Whether this mount point addresses an archive inside another file
    /// system.
    pub fn is_nested(&self) -> bool {
        matches!(self.0.kind, Kind::Nested { .. })
    }

    /// Nesting depth: zero for a host file system.
    pub fn depth(&self) -> usize {
        match &self.0.kind {
            Kind::Opaque => 0,
            Kind::Nested { parent, .. } => parent.depth() + 1,
        }
    }

    /// Resolve a relative entry name against this mount point.
    pub fn resolve(&self, relative: &str) -> FsResult<crate::addr::FsPath> {
        Ok(crate::addr::FsPath::new(
            self.clone(),
            EntryName::new(relative)?,
        ))
    }
}

impl PartialEq for MountPoint {
    fn eq(&self, other: &Self) -> bool {
        self.0.rendered == other.0.rendered
    }
}

impl Eq for MountPoint {}

impl Hash for MountPoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.rendered.hash(state);
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.rendered)
    }
}

impl fmt::Debug for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MountPoint({})", self.0.rendered)
    }
}

impl FromStr for MountPoint {
    type Err = FsError;

    fn from_str(s: &str) -> FsResult<MountPoint> {
        MountPoint::parse(s)
    }
}

/// Split a path URI (everything between a scheme and a trailing `!/`) into
/// its mount point and entry name.
pub(crate) fn split_path(uri: &str) -> FsResult<(MountPoint, EntryName)> {
    match memmem::rfind(uri.as_bytes(), SEPARATOR.as_bytes()) {
        Some(i) => {
            let parent = MountPoint::parse(&uri[..i + SEPARATOR.len()])?;
            let entry = EntryName::parse_uri(&uri[i + SEPARATOR.len()..])?;
            Ok((parent, entry))
        }
        None => {
            // An opaque URI: the segments up to and including the last `/`
            // form the host mount point, the remainder the entry name.
            let j = uri
                .rfind('/')
                .ok_or_else(|| FsError::NonabsoluteUri(uri.to_string()))?;
            let parent = MountPoint::parse(&uri[..j + 1])?;
            let entry = EntryName::parse_uri(&uri[j + 1..])?;
            Ok((parent, entry))
        }
    }
}

/// Canonicalize an absolute hierarchical path: decode percent escapes,
/// resolve `.`/`..` and guarantee exactly one trailing `/`.
fn canonicalize_absolute(path: &str) -> FsResult<String> {
    let decoded = decode_percent(path)?;
    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(FsError::MalformedUri(format!(
                        "path escapes the root: {path:?}"
                    )));
                }
            }
            _ => segments.push(segment),
        }
    }
    if segments.is_empty() {
        return Ok("/".to_string());
    }
    Ok(format!("/{}/", segments.join("/")))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn opaque_round_trip() {
        let mp = MountPoint::parse("file:/tmp/stuff/").unwrap();
        assert_eq!(mp.render(), "file:/tmp/stuff/");
        assert!(!mp.is_nested());
        assert_eq!(mp.depth(), 0);
        assert!(mp.parent().is_none());
    }

    #[test]
    fn opaque_canonicalization() {
        let mp = MountPoint::parse("file:/tmp//a/./b/../c").unwrap();
        assert_eq!(mp.render(), "file:/tmp/a/c/");
        assert_eq!(MountPoint::parse("file:/").unwrap().render(), "file:/");
    }

    #[test]
    fn nested_round_trip() {
        let uri = "sar:file:/tmp/a.sar!/";
        let mp = MountPoint::parse(uri).unwrap();
        assert_eq!(mp.render(), uri);
        assert_eq!(mp.scheme().as_str(), "sar");
        assert_eq!(mp.parent().unwrap().render(), "file:/tmp/");
        assert_eq!(mp.entry_in_parent().unwrap().as_str(), "a.sar");
        assert_eq!(mp.depth(), 1);
    }

    #[test]
    fn doubly_nested_round_trip() {
        let uri = "sar:sar:file:/tmp/a.sar!/dir/b.sar!/";
        let mp = MountPoint::parse(uri).unwrap();
        assert_eq!(mp.render(), uri);
        assert_eq!(mp.depth(), 2);
        let parent = mp.parent().unwrap();
        assert_eq!(parent.render(), "sar:file:/tmp/a.sar!/");
        assert_eq!(mp.entry_in_parent().unwrap().as_str(), "dir/b.sar");
    }

    #[test]
    fn parse_rejects_defects() {
        assert!(MountPoint::parse("no-scheme").is_err());
        assert!(MountPoint::parse("file:relative").is_err());
        assert!(MountPoint::parse("sar:file:/tmp/!/").is_err());
    }

    #[test]
    fn resolve_forms_paths() {
        let mp = MountPoint::parse("sar:file:/tmp/a.sar!/").unwrap();
        let path = mp.resolve("d/./x").unwrap();
        assert_eq!(path.render(), "sar:file:/tmp/a.sar!/d/x");
    }

    #[test]
    fn interned_equality() {
        let a = MountPoint::parse("sar:file:/tmp/a.sar!/").unwrap();
        let b = MountPoint::parse("sar:file:/tmp//a.sar!/").unwrap();
        assert_eq!(a, b);
    }
}
