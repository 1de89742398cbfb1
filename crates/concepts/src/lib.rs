pub mod prefixed_ulid;
pub mod storage;
pub mod time;

mod error_conversions;
#[cfg(feature = "rusqlite")]
mod rusqlite_ext;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    borrow::Borrow,
    fmt::{Debug, Display},
    hash::Hash,
    marker::PhantomData,
    ops::Deref,
    str::FromStr,
    sync::Arc,
};

pub use prefixed_ulid::ChangeId;

/// A stored document. Only JSON objects can be stored.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Writer tag field holding the name of the handler that performed the last write.
pub const LAST_MODIFIED_BY: &str = "lastModifiedBy";
/// Writer tag field holding the timestamp of the last handler write.
pub const LAST_MODIFIED_AT: &str = "lastModifiedAt";

/// Format used for every timestamp stored inside documents.
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StrVariant {
    Static(&'static str),
    Arc(Arc<str>),
}

impl StrVariant {
    #[must_use]
    pub const fn empty() -> StrVariant {
        StrVariant::Static("")
    }
}

impl From<String> for StrVariant {
    fn from(value: String) -> Self {
        StrVariant::Arc(Arc::from(value))
    }
}

impl From<&'static str> for StrVariant {
    fn from(value: &'static str) -> Self {
        StrVariant::Static(value)
    }
}

impl Deref for StrVariant {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        match self {
            Self::Arc(v) => v,
            Self::Static(v) => v,
        }
    }
}

impl Display for StrVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self)
    }
}

#[derive(Hash, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Name<T> {
    value: Arc<String>,
    phantom_data: PhantomData<fn(T) -> T>,
}

impl<T> Name<T> {
    #[must_use]
    pub fn new(value: String) -> Self {
        Self {
            value: Arc::new(value),
            phantom_data: PhantomData,
        }
    }
}

impl<T> Display for Name<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T> Debug for Name<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

impl<T> Deref for Name<T> {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.value.deref().deref()
    }
}

impl<T> Borrow<str> for Name<T> {
    fn borrow(&self) -> &str {
        self.deref()
    }
}

impl<T> From<&str> for Name<T> {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

impl<T> Serialize for Name<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self)
    }
}

impl<'de, T> Deserialize<'de> for Name<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

#[derive(Hash, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HandlerNameMarker;

/// Stable name of a reactive handler, e.g. `incrementLoginCount`.
pub type HandlerName = Name<HandlerNameMarker>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathParseError {
    #[error("path must not be empty")]
    Empty,
    #[error("segment {0} is empty")]
    EmptySegment(usize),
    #[error("document path must have an even number of segments, got {0}")]
    OddSegmentCount(usize),
    #[error("wildcard is only allowed in place of a document id")]
    MisplacedWildcard,
    #[error("`*` is reserved for collection patterns")]
    WildcardInPath,
}

fn parse_segments(input: &str, separator: char) -> Result<usize, PathParseError> {
    if input.is_empty() {
        return Err(PathParseError::Empty);
    }
    let mut count = 0;
    for (idx, segment) in input.split(separator).enumerate() {
        if segment.is_empty() {
            return Err(PathParseError::EmptySegment(idx));
        }
        count += 1;
    }
    Ok(count)
}

/// Address of a single document: alternating collection and id segments,
/// e.g. `tenants/t1/users/u1`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentPath(Arc<str>);

impl DocumentPath {
    pub fn segments(&self) -> std::str::Split<'_, char> {
        self.0.split('/')
    }

    /// Name of the collection holding this document.
    #[must_use]
    pub fn collection(&self) -> &str {
        self.0.rsplit('/').nth(1).unwrap_or_default()
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// The document owning this document's collection, if the collection is nested.
    #[must_use]
    pub fn parent_document(&self) -> Option<DocumentPath> {
        let (rest, _id) = self.0.rsplit_once('/')?;
        let (parent, _collection) = rest.rsplit_once('/')?;
        Some(Self(Arc::from(parent)))
    }

    pub fn child(&self, collection: &str, id: &str) -> Result<DocumentPath, PathParseError> {
        format!("{self}/{collection}/{id}").parse()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DocumentPath {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let count = parse_segments(s, '/')?;
        if count % 2 != 0 {
            return Err(PathParseError::OddSegmentCount(count));
        }
        if s.split('/').any(|segment| segment == "*") {
            return Err(PathParseError::WildcardInPath);
        }
        Ok(Self(Arc::from(s)))
    }
}

impl TryFrom<String> for DocumentPath {
    type Error = PathParseError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DocumentPath> for String {
    fn from(value: DocumentPath) -> Self {
        value.0.to_string()
    }
}

impl Display for DocumentPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for DocumentPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

/// Selects documents by path. Id segments may be replaced by `*`,
/// e.g. `tenants/*/teams/*/members/*`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionPattern(Arc<str>);

impl CollectionPattern {
    #[must_use]
    pub fn matches(&self, path: &DocumentPath) -> bool {
        let mut pattern = self.0.split('/');
        let mut segments = path.segments();
        loop {
            match (pattern.next(), segments.next()) {
                (None, None) => return true,
                (Some(expected), Some(actual)) if expected == "*" || expected == actual => {}
                _ => return false,
            }
        }
    }
}

impl FromStr for CollectionPattern {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let count = parse_segments(s, '/')?;
        if count % 2 != 0 {
            return Err(PathParseError::OddSegmentCount(count));
        }
        if s
            .split('/')
            .enumerate()
            .any(|(idx, segment)| idx % 2 == 0 && segment == "*")
        {
            return Err(PathParseError::MisplacedWildcard);
        }
        Ok(Self(Arc::from(s)))
    }
}

impl TryFrom<String> for CollectionPattern {
    type Error = PathParseError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CollectionPattern> for String {
    fn from(value: CollectionPattern) -> Self {
        value.0.to_string()
    }
}

impl Display for CollectionPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for CollectionPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

/// Dotted path to a field inside a document, e.g. `profile.displayName`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath(Arc<str>);

impl FieldPath {
    /// Resolve the field, descending into nested objects.
    #[must_use]
    pub fn lookup<'a>(&self, document: &'a Document) -> Option<&'a serde_json::Value> {
        let mut segments = self.0.split('.');
        let mut current = document.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// First segment of the path.
    #[must_use]
    pub fn root(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }

    #[must_use]
    pub fn is_writer_tag(&self) -> bool {
        matches!(self.root(), LAST_MODIFIED_BY | LAST_MODIFIED_AT)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for FieldPath {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_segments(s, '.')?;
        Ok(Self(Arc::from(s)))
    }
}

impl TryFrom<String> for FieldPath {
    type Error = PathParseError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FieldPath> for String {
    fn from(value: FieldPath) -> Self {
        value.0.to_string()
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    fn from_presence(before: bool, after: bool) -> ChangeKind {
        match (before, after) {
            (true, true) => ChangeKind::Update,
            (true, false) => ChangeKind::Delete,
            (false, _) => ChangeKind::Create,
        }
    }
}

/// Emitted by a document store for every committed create, update or delete.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub change_id: ChangeId,
    pub document_path: DocumentPath,
    pub before: Option<Arc<Document>>,
    pub after: Option<Arc<Document>>,
    pub committed_at: DateTime<Utc>,
}

impl ChangeRecord {
    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        ChangeKind::from_presence(self.before.is_some(), self.after.is_some())
    }
}

/// Identifies one delivery target of a change: the same change delivered to the
/// same handler always carries the same event id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Arc<str>);

impl EventId {
    #[must_use]
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn derive(change_id: &ChangeId, handler_name: &HandlerName) -> Self {
        Self(Arc::from(format!("{change_id}.{handler_name}")))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

/// What a handler receives for a single change.
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub event_id: EventId,
    pub document_path: DocumentPath,
    pub before: Option<Arc<Document>>,
    pub after: Option<Arc<Document>>,
    pub delivery_timestamp: DateTime<Utc>,
}

impl ChangeNotification {
    #[must_use]
    pub fn new(
        change: &ChangeRecord,
        handler_name: &HandlerName,
        delivery_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: EventId::derive(&change.change_id, handler_name),
            document_path: change.document_path.clone(),
            before: change.before.clone(),
            after: change.after.clone(),
            delivery_timestamp,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        ChangeKind::from_presence(self.before.is_some(), self.after.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        let serde_json::Value::Object(map) = value else {
            unreachable!("not an object")
        };
        map
    }

    #[rstest]
    #[case("users/u1")]
    #[case("tenants/t1/teams/a/members/b")]
    fn document_path_should_parse(#[case] input: &str) {
        let path: DocumentPath = input.parse().unwrap();
        assert_eq!(input, path.to_string());
    }

    #[test]
    fn document_path_should_reject_invalid_input() {
        assert_matches!("".parse::<DocumentPath>(), Err(PathParseError::Empty));
        assert_matches!(
            "users".parse::<DocumentPath>(),
            Err(PathParseError::OddSegmentCount(1))
        );
        assert_matches!(
            "users//u1".parse::<DocumentPath>(),
            Err(PathParseError::EmptySegment(1))
        );
        assert_matches!(
            "users/*".parse::<DocumentPath>(),
            Err(PathParseError::WildcardInPath)
        );
    }

    #[test]
    fn document_path_navigation() {
        let path: DocumentPath = "tenants/t1/teams/a/members/b".parse().unwrap();
        assert_eq!("members", path.collection());
        assert_eq!("b", path.id());
        let team = path.parent_document().unwrap();
        assert_eq!("tenants/t1/teams/a", team.as_str());
        assert_eq!("tenants/t1", team.parent_document().unwrap().as_str());
        assert_eq!(None, "users/u1".parse::<DocumentPath>().unwrap().parent_document());
        assert_eq!(
            "tenants/t1/activityLog/x",
            team.parent_document()
                .unwrap()
                .child("activityLog", "x")
                .unwrap()
                .as_str()
        );
    }

    #[rstest]
    #[case("tenants/*/users/*", "tenants/t1/users/u1", true)]
    #[case("tenants/*/users/*", "tenants/t1/teams/u1", false)]
    #[case("tenants/*/users/*", "tenants/t1/users/u1/devices/d", false)]
    #[case("tenants/t1/users/*", "tenants/t2/users/u1", false)]
    #[case("tenants/*", "tenants/t2", true)]
    fn collection_pattern_matching(
        #[case] pattern: &str,
        #[case] path: &str,
        #[case] expected: bool,
    ) {
        let pattern: CollectionPattern = pattern.parse().unwrap();
        assert_eq!(expected, pattern.matches(&path.parse().unwrap()));
    }

    #[test]
    fn collection_pattern_rejects_wildcard_collection() {
        assert_matches!(
            "*/u1".parse::<CollectionPattern>(),
            Err(PathParseError::MisplacedWildcard)
        );
    }

    #[test]
    fn field_path_lookup_descends_into_objects() {
        let document = doc(json!({"profile": {"name": "Ann"}, "a": 1}));
        let name: FieldPath = "profile.name".parse().unwrap();
        assert_eq!(Some(&json!("Ann")), name.lookup(&document));
        let missing: FieldPath = "a.b".parse().unwrap();
        assert_eq!(None, missing.lookup(&document));
        assert!(!name.is_writer_tag());
        assert!("lastModifiedBy".parse::<FieldPath>().unwrap().is_writer_tag());
    }

    #[test]
    fn event_id_is_stable_per_change_and_handler() {
        let change_id = ChangeId::generate();
        let a = HandlerName::from("a");
        let b = HandlerName::from("b");
        assert_eq!(EventId::derive(&change_id, &a), EventId::derive(&change_id, &a));
        assert_ne!(EventId::derive(&change_id, &a), EventId::derive(&change_id, &b));
    }

    #[test]
    fn event_id_serializes_as_plain_string() {
        let event_id = EventId::new("chg_1.incrementLoginCount");
        let value = serde_json::to_value(&event_id).unwrap();
        assert_eq!(json!("chg_1.incrementLoginCount"), value);
        assert_eq!(event_id, serde_json::from_value::<EventId>(value).unwrap());
    }
}
