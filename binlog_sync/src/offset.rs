use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OffsetParseError {
    #[error("empty offset token")]
    Empty,

    #[error("invalid gtid fragment `{0}`")]
    InvalidGtid(String),

    #[error("invalid file position `{0}`")]
    InvalidFilePosition(String),

    #[error("gtid fragment `{0}` has no source id and no offset prefix is configured")]
    MissingPrefix(String),

    #[error("cannot merge a {0} offset into a {1} offset")]
    SchemeMismatch(OffsetScheme, OffsetScheme),
}

/// How the upstream identifies a resumable position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetScheme {
    #[default]
    Gtid,
    FilePosition,
}

impl fmt::Display for OffsetScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetScheme::Gtid => write!(f, "gtid"),
            OffsetScheme::FilePosition => write!(f, "file position"),
        }
    }
}

/// Last transaction number seen per source server.
///
/// A set built from a single event holds one fragment; fragments observed by
/// concurrent dispatch tasks are folded together with [`GtidSet::merge`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GtidSet {
    transactions: BTreeMap<String, u64>,
}

impl GtidSet {
    pub fn single(source_id: impl Into<String>, transaction: u64) -> Self {
        let mut transactions = BTreeMap::new();
        transactions.insert(source_id.into(), transaction);
        GtidSet { transactions }
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn transaction(&self, source_id: &str) -> Option<u64> {
        self.transactions.get(source_id).copied()
    }

    fn fragments(&self) -> Vec<(&str, u64)> {
        self.transactions
            .iter()
            .map(|(source, &txn)| (source.as_str(), txn))
            .collect()
    }

    /// Highest transaction number across all sources.
    pub fn last_transaction(&self) -> Option<u64> {
        self.transactions.values().copied().max()
    }

    /// Folds `other` into `self`, keeping the max per source. Returns whether
    /// anything moved forward.
    pub fn merge(&mut self, other: &GtidSet) -> bool {
        let mut advanced = false;
        for (source, &txn) in &other.transactions {
            let entry = self.transactions.entry(source.clone()).or_insert(0);
            if txn > *entry {
                *entry = txn;
                advanced = true;
            }
        }
        advanced
    }

    fn parse_fragment(fragment: &str) -> Result<(String, u64), OffsetParseError> {
        let invalid = || OffsetParseError::InvalidGtid(fragment.to_string());
        let (source, intervals) = match fragment.split_once(':') {
            Some((source, intervals)) => (source.trim(), intervals),
            None => ("", fragment),
        };

        let mut last = None;
        for interval in intervals.split(':') {
            let end = match interval.split_once('-') {
                Some((start, end)) => {
                    start.trim().parse::<u64>().map_err(|_| invalid())?;
                    end
                }
                None => interval,
            };
            let end: u64 = end.trim().parse().map_err(|_| invalid())?;
            last = Some(last.map_or(end, |l: u64| l.max(end)));
        }

        Ok((source.to_string(), last.ok_or_else(invalid)?))
    }
}

impl FromStr for GtidSet {
    type Err = OffsetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = GtidSet::default();
        for fragment in s.split([',', '\n']).map(str::trim) {
            if fragment.is_empty() {
                continue;
            }
            let (source, txn) = GtidSet::parse_fragment(fragment)?;
            set.merge(&GtidSet::single(source, txn));
        }
        if set.is_empty() {
            return Err(OffsetParseError::Empty);
        }
        Ok(set)
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (source, txn) in &self.transactions {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if source.is_empty() {
                write!(f, "{txn}")?;
            } else {
                write!(f, "{source}:{txn}")?;
            }
        }
        Ok(())
    }
}

/// A resumable position in the upstream replication log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOffset {
    Gtid(GtidSet),
    FilePosition { file: String, position: u64 },
}

impl ReplicationOffset {
    pub fn parse(scheme: OffsetScheme, token: &str) -> Result<Self, OffsetParseError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(OffsetParseError::Empty);
        }
        match scheme {
            OffsetScheme::Gtid => Ok(ReplicationOffset::Gtid(token.parse()?)),
            OffsetScheme::FilePosition => {
                let invalid = || OffsetParseError::InvalidFilePosition(token.to_string());
                let (file, position) = token.rsplit_once(':').ok_or_else(invalid)?;
                if file.is_empty() {
                    return Err(invalid());
                }
                Ok(ReplicationOffset::FilePosition {
                    file: file.to_string(),
                    position: position.parse().map_err(|_| invalid())?,
                })
            }
        }
    }

    pub fn scheme(&self) -> OffsetScheme {
        match self {
            ReplicationOffset::Gtid(_) => OffsetScheme::Gtid,
            ReplicationOffset::FilePosition { .. } => OffsetScheme::FilePosition,
        }
    }

    /// Folds a concurrently observed offset into this one. The result never
    /// sorts before either input.
    pub fn merge(&mut self, other: &ReplicationOffset) -> Result<bool, OffsetParseError> {
        match (self, other) {
            (ReplicationOffset::Gtid(ours), ReplicationOffset::Gtid(theirs)) => {
                Ok(ours.merge(theirs))
            }
            (
                ReplicationOffset::FilePosition { file, position },
                ReplicationOffset::FilePosition {
                    file: other_file,
                    position: other_position,
                },
            ) => {
                if (other_file.as_str(), *other_position) > (file.as_str(), *position) {
                    file.clone_from(other_file);
                    *position = *other_position;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            (ours, theirs) => Err(OffsetParseError::SchemeMismatch(
                theirs.scheme(),
                ours.scheme(),
            )),
        }
    }

    /// Whether `other` is already included in this offset.
    pub fn covers(&self, other: &ReplicationOffset) -> Result<bool, OffsetParseError> {
        let mut merged = self.clone();
        Ok(!merged.merge(other)?)
    }

    /// Token handed to the upstream to continue after this offset.
    ///
    /// GTID offsets become `source:1-<txn>` for every fragment. A configured
    /// prefix names the source of a single-fragment set and of fragments
    /// stored without a source id; other sources keep their own numbers.
    pub fn resume_token(&self, prefix: Option<&str>) -> Result<String, OffsetParseError> {
        match self {
            ReplicationOffset::Gtid(set) => {
                let prefix = prefix.filter(|p| !p.is_empty());
                if let (Some(prefix), [(_, txn)]) = (prefix, &*set.fragments()) {
                    return Ok(format!("{prefix}:1-{txn}"));
                }
                if set.is_empty() {
                    return Err(OffsetParseError::Empty);
                }

                let mut fragments: BTreeMap<&str, u64> = BTreeMap::new();
                for (source, txn) in set.fragments() {
                    let source = match (source, prefix) {
                        ("", Some(prefix)) => prefix,
                        ("", None) => {
                            return Err(OffsetParseError::MissingPrefix(txn.to_string()))
                        }
                        (source, _) => source,
                    };
                    let entry = fragments.entry(source).or_default();
                    *entry = (*entry).max(txn);
                }
                Ok(fragments
                    .iter()
                    .map(|(source, txn)| format!("{source}:1-{txn}"))
                    .collect::<Vec<_>>()
                    .join(","))
            }
            ReplicationOffset::FilePosition { file, position } => Ok(format!("{file}:{position}")),
        }
    }
}

impl fmt::Display for ReplicationOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationOffset::Gtid(set) => write!(f, "{set}"),
            ReplicationOffset::FilePosition { file, position } => write!(f, "{file}:{position}"),
        }
    }
}

/// Where the upstream stream should begin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPosition {
    /// No prior offset: follow the current end of the log.
    Tail,
    /// No prior offset and a full refresh was requested.
    FromStart,
    Resume {
        offset: ReplicationOffset,
        token: String,
    },
}

impl StartPosition {
    pub fn resolve(
        stored: Option<ReplicationOffset>,
        prefix: Option<&str>,
        refresh_from_start: bool,
    ) -> Result<StartPosition, OffsetParseError> {
        match stored {
            Some(offset) => {
                let token = offset.resume_token(prefix)?;
                Ok(StartPosition::Resume { offset, token })
            }
            None if refresh_from_start => Ok(StartPosition::FromStart),
            None => Ok(StartPosition::Tail),
        }
    }

    pub fn offset(&self) -> Option<&ReplicationOffset> {
        match self {
            StartPosition::Resume { offset, .. } => Some(offset),
            _ => None,
        }
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartPosition::Tail => write!(f, "tail"),
            StartPosition::FromStart => write!(f, "start"),
            StartPosition::Resume { token, .. } => write!(f, "{token}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gtid(s: &str) -> ReplicationOffset {
        ReplicationOffset::parse(OffsetScheme::Gtid, s).unwrap()
    }

    #[test]
    fn parses_single_gtid() {
        let offset = gtid("g:5");
        assert_eq!(offset.to_string(), "g:5");
        match &offset {
            ReplicationOffset::Gtid(set) => assert_eq!(set.transaction("g"), Some(5)),
            other => panic!("unexpected offset {other:?}"),
        }
    }

    #[test]
    fn parses_intervals_and_duplicate_lines() {
        let offset = gtid("3e11fa47-71ca:1-7\n3e11fa47-71ca:1-7\nabc:1-3:5-9\n");
        assert_eq!(offset.to_string(), "3e11fa47-71ca:7,abc:9");
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            ReplicationOffset::parse(OffsetScheme::Gtid, "  "),
            Err(OffsetParseError::Empty)
        );
        assert!(matches!(
            ReplicationOffset::parse(OffsetScheme::Gtid, "g:x"),
            Err(OffsetParseError::InvalidGtid(_))
        ));
        assert!(matches!(
            ReplicationOffset::parse(OffsetScheme::FilePosition, "no-position"),
            Err(OffsetParseError::InvalidFilePosition(_))
        ));
    }

    #[test]
    fn merge_never_recedes() {
        let mut offset = gtid("g:5");
        assert!(!offset.merge(&gtid("g:3")).unwrap());
        assert_eq!(offset.to_string(), "g:5");
        assert!(offset.merge(&gtid("g:6,h:2")).unwrap());
        assert_eq!(offset.to_string(), "g:6,h:2");
    }

    #[test]
    fn merge_file_positions() {
        let mut offset =
            ReplicationOffset::parse(OffsetScheme::FilePosition, "mysql-bin.000003:1200").unwrap();
        let older =
            ReplicationOffset::parse(OffsetScheme::FilePosition, "mysql-bin.000003:900").unwrap();
        let newer =
            ReplicationOffset::parse(OffsetScheme::FilePosition, "mysql-bin.000004:4").unwrap();

        assert!(!offset.merge(&older).unwrap());
        assert!(offset.merge(&newer).unwrap());
        assert_eq!(offset.to_string(), "mysql-bin.000004:4");
    }

    #[test]
    fn covers_earlier_offsets() {
        let resume = gtid("a:5,b:2");
        assert!(resume.covers(&gtid("a:3")).unwrap());
        assert!(resume.covers(&gtid("a:5,b:2")).unwrap());
        assert!(!resume.covers(&gtid("b:3")).unwrap());
        assert!(!resume.covers(&gtid("c:1")).unwrap());
    }

    #[test]
    fn merge_across_schemes_fails() {
        let mut offset = gtid("g:1");
        let file = ReplicationOffset::parse(OffsetScheme::FilePosition, "bin.1:4").unwrap();
        assert!(matches!(
            offset.merge(&file),
            Err(OffsetParseError::SchemeMismatch(..))
        ));
    }

    #[test]
    fn resume_token_uses_prefix() {
        assert_eq!(
            gtid("g:5").resume_token(Some("prefix")).unwrap(),
            "prefix:1-5"
        );
        assert_eq!(gtid("5").resume_token(Some("prefix")).unwrap(), "prefix:1-5");
        assert_eq!(gtid("a:5,b:2").resume_token(None).unwrap(), "a:1-5,b:1-2");
        assert!(matches!(
            gtid("5").resume_token(None),
            Err(OffsetParseError::MissingPrefix(_))
        ));
    }

    #[test]
    fn resume_token_keeps_every_source_of_a_multi_source_set() {
        assert_eq!(
            gtid("a:5,b:9").resume_token(Some("a")).unwrap(),
            "a:1-5,b:1-9"
        );
        assert_eq!(
            gtid("a:5,b:9").resume_token(Some("c")).unwrap(),
            "a:1-5,b:1-9"
        );
        assert_eq!(
            gtid("7,b:9").resume_token(Some("a")).unwrap(),
            "a:1-7,b:1-9"
        );
        assert_eq!(
            gtid("7,a:3,b:9").resume_token(Some("a")).unwrap(),
            "a:1-7,b:1-9"
        );
    }

    #[test]
    fn start_position_policy() {
        assert_eq!(
            StartPosition::resolve(None, None, false).unwrap(),
            StartPosition::Tail
        );
        assert_eq!(
            StartPosition::resolve(None, None, true).unwrap(),
            StartPosition::FromStart
        );
        let resumed = StartPosition::resolve(Some(gtid("g:5")), Some("prefix"), true).unwrap();
        assert_eq!(resumed.to_string(), "prefix:1-5");
        assert_eq!(resumed.offset(), Some(&gtid("g:5")));
    }
}
