//! Normalized entry names.

use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;

use crate::addr::decode_percent;
use crate::error::{FsError, FsResult};

/// A normalized path relative to the root of one file system.
///
/// The canonical form never starts with `/`, uses `/` as the separator,
/// contains no `.` or `..` segments and no trailing separator; the empty
/// string names the root entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryName(String);

impl EntryName {
    /// The root entry name.
    pub fn root() -> EntryName {
        EntryName(String::new())
    }

    /// Canonicalize a literal name.
    ///
    /// Empty segments and `.` are dropped, `..` pops the previous segment.
    /// A leading `/`, a `..` that would escape the root, or a segment
    /// containing the archive separator character `!` is malformed.
    pub fn new(s: &str) -> FsResult<EntryName> {
        if s.starts_with('/') {
            return Err(FsError::MalformedUri(format!(
                "entry name must be relative: {s:?}"
            )));
        }
        let mut segments: SmallVec<[&str; 8]> = SmallVec::new();
        for segment in s.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(FsError::MalformedUri(format!(
                            "entry name escapes the root: {s:?}"
                        )));
                    }
                }
                _ if segment.contains('!') => {
                    return Err(FsError::MalformedUri(format!(
                        "entry name contains '!': {s:?}"
                    )));
                }
                _ => segments.push(segment),
            }
        }
        Ok(EntryName(segments.join("/")))
    }

    /// Canonicalize a name taken from a URI, decoding percent escapes first.
    pub(crate) fn parse_uri(s: &str) -> FsResult<EntryName> {
        EntryName::new(&decode_percent(s)?)
    }

    /// Whether this is the root entry.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The canonical form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name of the enclosing directory, or `None` for the root.
    pub fn parent(&self) -> Option<EntryName> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(i) => Some(EntryName(self.0[..i].to_string())),
            None => Some(EntryName::root()),
        }
    }

    /// The last segment, i.e. the simple name within the enclosing
    /// directory. The root's simple name is the empty string.
    pub fn simple_name(&self) -> &str {
        match self.0.rfind('/') {
            Some(i) => &self.0[i + 1..],
            None => &self.0,
        }
    }

    /// Resolve a relative name against this one.
    pub fn join(&self, relative: &str) -> FsResult<EntryName> {
        if self.is_root() {
            return EntryName::new(relative);
        }
        EntryName::new(&format!("{}/{}", self.0, relative))
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntryName {
    type Err = FsError;

    fn from_str(s: &str) -> FsResult<EntryName> {
        EntryName::new(s)
    }
}
