//! URI scheme names.

use std::fmt;
use std::str::FromStr;

use crate::error::{FsError, FsResult};

/// A URI scheme, identifying a driver family (`file`, `zip`, `tar`, ...).
///
/// Schemes are stored lowercase and compare case-insensitively by
/// construction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scheme(String);

impl Scheme {
    /// Validate and normalize a scheme name per RFC 2396: an ASCII letter
    /// followed by letters, digits, `+`, `-` or `.`.
    pub fn new(s: &str) -> FsResult<Scheme> {
        let mut chars = s.chars();
        let valid = match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => {
                chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
            }
            _ => false,
        };
        if !valid {
            return Err(FsError::MalformedUri(format!("invalid scheme {s:?}")));
        }
        Ok(Scheme(s.to_ascii_lowercase()))
    }

    /// The scheme as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Scheme {
    type Err = FsError;

    fn from_str(s: &str) -> FsResult<Scheme> {
        Scheme::new(s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accepts_and_lowercases() {
        assert_eq!(Scheme::new("TarGz").unwrap().as_str(), "targz");
        assert_eq!(Scheme::new("x+y-z.1").unwrap().as_str(), "x+y-z.1");
    }

    #[test]
    fn rejects_invalid() {
        assert!(Scheme::new("").is_err());
        assert!(Scheme::new("1zip").is_err());
        assert!(Scheme::new("zi p").is_err());
    }
}
