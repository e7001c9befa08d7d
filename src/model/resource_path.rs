use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::ops::Deref;

use crate::error::{invalid_argument, FirestoreResult};

/// Maximum size of a single path segment in UTF-8 bytes.
const MAX_SEGMENT_BYTES: usize = 1500;

/// What a path addresses inside the document tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathKind {
    Root,
    Collection,
    Document,
}

/// A slash-separated path relative to the database's document root.
///
/// Segments alternate collection id / document id, so a path with an odd
/// number of segments names a collection and an even (non-zero) number names
/// a document.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    pub fn from_segments<I, S>(segments: I) -> FirestoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for segment in &segments {
            validate_segment(segment)?;
        }
        Ok(Self { segments })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        if path.trim().is_empty() {
            return Ok(Self::root());
        }

        if path.contains("//") {
            return Err(invalid_argument(format!(
                "Invalid path ({path}). Paths must not contain // in them."
            )));
        }

        Self::from_segments(
            path.split('/')
                .filter(|segment| !segment.is_empty())
                .map(|segment| segment.to_string()),
        )
    }

    pub fn kind(&self) -> PathKind {
        match self.segments.len() {
            0 => PathKind::Root,
            len if len % 2 == 1 => PathKind::Collection,
            _ => PathKind::Document,
        }
    }

    pub fn is_document(&self) -> bool {
        self.kind() == PathKind::Document
    }

    pub fn is_collection(&self) -> bool {
        self.kind() == PathKind::Collection
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(|s| s.as_str())
    }

    pub fn child<I, S>(&self, segments: I) -> FirestoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut new_segments = self.segments.clone();
        for segment in segments {
            let segment = segment.into();
            validate_segment(&segment)?;
            new_segments.push(segment);
        }
        Ok(Self {
            segments: new_segments,
        })
    }

    /// The parent path, with the root as its own parent.
    pub fn parent(&self) -> Self {
        if self.segments.is_empty() {
            return Self::root();
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    pub fn as_slice(&self) -> &[String] {
        &self.segments
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        if self.len() > other.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(l, r)| l == r)
    }

    pub fn comparator(left: &Self, right: &Self) -> Ordering {
        for (l, r) in left.segments.iter().zip(right.segments.iter()) {
            match l.cmp(r) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        left.len().cmp(&right.len())
    }
}

fn validate_segment(segment: &str) -> FirestoreResult<()> {
    if segment.is_empty() {
        return Err(invalid_argument("Found empty segment in resource path"));
    }
    if segment == "." || segment == ".." {
        return Err(invalid_argument(format!(
            "Invalid path segment ({segment}). Segments must not be . or .."
        )));
    }
    if segment.starts_with("__") && segment.ends_with("__") && segment.len() >= 4 {
        return Err(invalid_argument(format!(
            "Invalid path segment ({segment}). Segments must not match __.*__"
        )));
    }
    if segment.len() > MAX_SEGMENT_BYTES {
        return Err(invalid_argument(
            "Path segments must not exceed 1500 bytes",
        ));
    }
    Ok(())
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

impl Deref for ResourcePath {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_render_path() {
        let path = ResourcePath::from_string("cities/sf/neighborhoods/downtown").unwrap();
        assert_eq!(path.len(), 4);
        assert_eq!(path.last_segment(), Some("downtown"));
        assert_eq!(path.canonical_string(), "cities/sf/neighborhoods/downtown");
        assert_eq!(path.kind(), PathKind::Document);
    }

    #[test]
    fn classifies_by_parity() {
        assert_eq!(ResourcePath::root().kind(), PathKind::Root);
        assert_eq!(
            ResourcePath::from_string("cities").unwrap().kind(),
            PathKind::Collection
        );
        assert_eq!(
            ResourcePath::from_string("cities/sf").unwrap().kind(),
            PathKind::Document
        );
    }

    #[test]
    fn parent_of_root_is_root() {
        let root = ResourcePath::root();
        assert_eq!(root.parent(), root);
    }

    #[test]
    fn rejects_empty_segments() {
        let err = ResourcePath::from_string("cities//sf").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn rejects_relative_segments() {
        assert!(ResourcePath::from_string("cities/..").is_err());
        assert!(ResourcePath::from_string("./cities").is_err());
    }

    #[test]
    fn rejects_reserved_segments() {
        let err = ResourcePath::from_string("cities/__id__").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn rejects_oversized_segments() {
        let long = "x".repeat(1501);
        assert!(ResourcePath::from_string(&format!("cities/{long}")).is_err());
    }
}
