//! Addressing model: schemes, entry names, mount points and paths.
//!
//! A mount point identifies one file system in the federation. It is either
//! an opaque absolute URI naming a host file system (`file:/tmp/`) or the
//! location of an archive inside its parent, rendered as
//! `scheme:<parent path>!/` (`sar:file:/tmp/a.sar!/`,
//! `sar:sar:file:/tmp/a.sar!/inner.sar!/`). A path pairs a mount point with
//! an entry name inside it.

mod entry_name;
mod mount_point;
mod path;
mod scheme;

pub use self::entry_name::EntryName;
pub use self::mount_point::MountPoint;
pub use self::path::FsPath;
pub use self::scheme::Scheme;

use crate::error::{FsError, FsResult};

/// The archive separator in rendered URIs.
pub const SEPARATOR: &str = "!/";

/// Split `scheme ":" rest`, validating the scheme.
pub(crate) fn split_scheme(uri: &str) -> FsResult<(Scheme, &str)> {
    let colon = uri
        .find(':')
        .ok_or_else(|| FsError::NonabsoluteUri(uri.to_string()))?;
    let scheme = Scheme::new(&uri[..colon])?;
    Ok((scheme, &uri[colon + 1..]))
}

/// Decode `%XX` escapes. Invalid escapes are a malformed URI.
pub(crate) fn decode_percent(s: &str) -> FsResult<String> {
    if !s.contains('%') {
        return Ok(s.to_string());
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| FsError::MalformedUri(s.to_string()))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| FsError::MalformedUri(s.to_string()))
}
