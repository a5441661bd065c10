//! Election root and candidate naming

use crate::error::{ElectionError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Width of the zero-padded sequence suffix assigned by the service.
pub const SEQUENCE_WIDTH: usize = 10;

/// Default prefix for candidate entry names.
pub const DEFAULT_CANDIDATE_PREFIX: &str = "candidate-";

/// Persistent namespace entry under which candidates register
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ElectionRoot(String);

impl ElectionRoot {
    /// Create a root from an absolute path such as `/services/leader`
    pub fn new<T: Into<String>>(path: T) -> Result<Self> {
        let path = path.into();
        validate_path(&path)?;
        if path == "/" {
            return Err(ElectionError::invalid_path(
                "election root cannot be the namespace root",
            ));
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Full path of a direct child of this root
    pub fn child_path(&self, name: &str) -> String {
        format!("{}/{}", self.0, name)
    }

    /// Every path from the top-level ancestor down to the root itself.
    ///
    /// `/a/b/c` yields `["/a", "/a/b", "/a/b/c"]`.
    pub fn ancestry(&self) -> Vec<String> {
        let mut paths = Vec::new();
        let mut current = String::new();
        for segment in self.0.split('/').skip(1) {
            current.push('/');
            current.push_str(segment);
            paths.push(current.clone());
        }
        paths
    }
}

impl fmt::Display for ElectionRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ElectionRoot {
    type Error = ElectionError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ElectionRoot> for String {
    fn from(root: ElectionRoot) -> Self {
        root.0
    }
}

/// Check that a path is absolute, has no trailing slash and no empty segments
pub fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ElectionError::invalid_path(format!(
            "{} is not absolute",
            path
        )));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(ElectionError::invalid_path(format!(
            "{} has a trailing slash",
            path
        )));
    }
    if path.split('/').skip(1).any(str::is_empty) {
        return Err(ElectionError::invalid_path(format!(
            "{} has an empty segment",
            path
        )));
    }
    Ok(())
}

/// Format a sequence number the way the service appends it to a name
pub fn format_sequence(sequence: u64) -> String {
    format!("{:0width$}", sequence, width = SEQUENCE_WIDTH)
}

/// A live candidate entry: `<root>/<prefix><sequence>`.
///
/// Ordering is by the embedded sequence number; the name is only a tiebreaker
/// so the ordering stays total.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CandidateId {
    path: String,
    name: String,
    sequence: u64,
}

impl CandidateId {
    /// Parse a child name returned by `get_children`
    pub fn from_child(root: &ElectionRoot, prefix: &str, name: &str) -> Result<Self> {
        let digits = name
            .strip_prefix(prefix)
            .ok_or_else(|| ElectionError::invalid_candidate(name))?;

        if digits.len() != SEQUENCE_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ElectionError::invalid_candidate(name));
        }

        let sequence = digits
            .parse::<u64>()
            .map_err(|_| ElectionError::invalid_candidate(name))?;

        Ok(Self {
            path: root.child_path(name),
            name: name.to_string(),
            sequence,
        })
    }

    /// Parse a full path returned by `create_node`
    pub fn from_path(root: &ElectionRoot, prefix: &str, path: &str) -> Result<Self> {
        let name = path
            .strip_prefix(root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|name| !name.contains('/'))
            .ok_or_else(|| ElectionError::invalid_candidate(path))?;

        Self::from_child(root, prefix, name)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Ord for CandidateId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for CandidateId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

/// Snapshot of live candidates, sorted ascending by sequence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateSet {
    candidates: Vec<CandidateId>,
}

impl CandidateSet {
    pub fn new(mut candidates: Vec<CandidateId>) -> Self {
        candidates.sort();
        candidates.dedup();
        Self { candidates }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Candidate holding the minimal sequence number
    pub fn leader(&self) -> Option<&CandidateId> {
        self.candidates.first()
    }

    pub fn contains(&self, id: &CandidateId) -> bool {
        self.candidates.binary_search(id).is_ok()
    }

    /// The largest candidate strictly smaller than `id`.
    ///
    /// `None` when `id` is the leader or not in the set.
    pub fn predecessor_of(&self, id: &CandidateId) -> Option<&CandidateId> {
        match self.candidates.binary_search(id) {
            Ok(0) | Err(_) => None,
            Ok(index) => self.candidates.get(index - 1),
        }
    }

    pub fn max_sequence(&self) -> Option<u64> {
        self.candidates.last().map(CandidateId::sequence)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidateId> {
        self.candidates.iter()
    }

    pub fn as_slice(&self) -> &[CandidateId] {
        &self.candidates
    }
}

impl<'a> IntoIterator for &'a CandidateSet {
    type Item = &'a CandidateId;
    type IntoIter = std::slice::Iter<'a, CandidateId>;

    fn into_iter(self) -> Self::IntoIter {
        self.candidates.iter()
    }
}
