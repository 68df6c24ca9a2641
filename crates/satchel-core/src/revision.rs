use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SatchelError};

// ---------------------------------------------------------------------------
// Revision
// ---------------------------------------------------------------------------

/// A revision identifier: `{pos}-{hash}`.
///
/// - `pos` is the generation number (starts at 1, increments each edit).
/// - `hash` is a 32-character hex MD5 digest over the revision's canonical
///   content and its parent revision id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Revision {
    pub pos: u64,
    pub hash: String,
}

impl Revision {
    pub fn new(pos: u64, hash: impl Into<String>) -> Self {
        Self {
            pos,
            hash: hash.into(),
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.pos, self.hash)
    }
}

impl From<Revision> for String {
    fn from(rev: Revision) -> String {
        rev.to_string()
    }
}

impl TryFrom<String> for Revision {
    type Error = SatchelError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl FromStr for Revision {
    type Err = SatchelError;

    fn from_str(s: &str) -> Result<Self> {
        let (pos_str, hash) = s
            .split_once('-')
            .ok_or_else(|| SatchelError::InvalidRev(s.to_string()))?;
        let pos: u64 = pos_str
            .parse()
            .map_err(|_| SatchelError::InvalidRev(s.to_string()))?;
        if pos == 0 || hash.is_empty() {
            return Err(SatchelError::InvalidRev(s.to_string()));
        }
        Ok(Revision {
            pos,
            hash: hash.to_string(),
        })
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.pos
            .cmp(&other.pos)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Change-feed position
// ---------------------------------------------------------------------------

/// A position in a change feed.
///
/// Satchel's own store counts changes with a plain integer. A CouchDB 3.x
/// peer instead hands out opaque cursor strings that must be echoed back
/// verbatim on the next poll, so the wire form is carried intact and only
/// interpreted when an ordering key is needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seq {
    Local(u64),
    Opaque(String),
}

impl Seq {
    /// The position before the first change.
    pub const START: Seq = Seq::Local(0);

    /// Ordering key for checkpoint monotonicity. Opaque cursors begin with
    /// a decimal ordinal (`"13-g1AAAA..."` orders as 13); one without any
    /// leading digits orders as 0.
    pub fn ordinal(&self) -> u64 {
        match self {
            Seq::Local(n) => *n,
            Seq::Opaque(cursor) => {
                let digits = cursor
                    .find(|c: char| !c.is_ascii_digit())
                    .map_or(cursor.as_str(), |end| &cursor[..end]);
                digits.parse().unwrap_or(0)
            }
        }
    }

    /// The exact value to hand back to the peer, e.g. in a `since=`
    /// parameter.
    pub fn wire_value(&self) -> String {
        match self {
            Seq::Local(n) => n.to_string(),
            Seq::Opaque(cursor) => cursor.clone(),
        }
    }
}

impl Default for Seq {
    fn default() -> Self {
        Seq::START
    }
}

impl From<u64> for Seq {
    fn from(n: u64) -> Self {
        Seq::Local(n)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire_value())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_display_and_parse() {
        let rev = Revision::new(3, "abc123");
        assert_eq!(rev.to_string(), "3-abc123");

        let parsed: Revision = "3-abc123".parse().unwrap();
        assert_eq!(parsed, rev);
    }

    #[test]
    fn revision_ordering() {
        let r1 = Revision::new(1, "aaa");
        let r2 = Revision::new(2, "aaa");
        let r3 = Revision::new(2, "bbb");
        assert!(r1 < r2);
        assert!(r2 < r3);
    }

    #[test]
    fn invalid_revision() {
        assert!("nope".parse::<Revision>().is_err());
        assert!("abc-123".parse::<Revision>().is_err());
        assert!("0-abc".parse::<Revision>().is_err());
        assert!("3-".parse::<Revision>().is_err());
    }

    #[test]
    fn revision_serde_as_string() {
        let rev = Revision::new(2, "ff00");
        let json = serde_json::to_string(&rev).unwrap();
        assert_eq!(json, "\"2-ff00\"");

        let back: Revision = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rev);
    }

    #[test]
    fn seq_opaque_cursor_ordering() {
        let seq = Seq::Opaque("13-g1AAAA".into());
        assert_eq!(seq.ordinal(), 13);
        assert_eq!(seq.wire_value(), "13-g1AAAA");

        assert_eq!(Seq::Opaque("garbage".into()).ordinal(), 0);
        assert_eq!(Seq::START.ordinal(), 0);
        assert_eq!(Seq::Local(7).wire_value(), "7");
    }
}
