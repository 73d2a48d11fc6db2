//! Decoded geolocation records and typed field access.
//!
//! A database lookup yields a [`LocatedEntry`] whose root is a [`RecordNode`]
//! tree. Fields inside it are addressed with a [`FieldPath`] and read back as a
//! [`FieldValue`], which is [`FieldValue::Absent`] whenever the path does not
//! lead to a scalar.

use std::fmt;
use std::str::FromStr;

use bstr::ByteSlice;
use rustc_hash::FxHashMap;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};

/// Maximum number of segments accepted in a configured field path.
pub const MAX_PATH_DEPTH: usize = 80;

/// Separator between segments of a configured field path.
pub const PATH_SEPARATOR: char = '/';

/// One node of a decoded database record.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordNode {
    Map(FxHashMap<String, RecordNode>),
    Array(Vec<RecordNode>),
    String(String),
    Bytes(Vec<u8>),
    Double(f64),
    Unsigned(u128),
    Signed(i64),
    Bool(bool),
    Null,
}

impl RecordNode {
    fn child(&self, segment: &str) -> Option<&RecordNode> {
        match self {
            RecordNode::Map(map) => map.get(segment),
            RecordNode::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }

    fn as_value(&self) -> FieldValue<'_> {
        match self {
            RecordNode::String(s) => FieldValue::String(s),
            RecordNode::Bytes(b) => FieldValue::Bytes(b),
            RecordNode::Double(d) => FieldValue::Double(*d),
            RecordNode::Unsigned(u) => FieldValue::Unsigned(*u),
            RecordNode::Signed(i) => FieldValue::Signed(*i),
            RecordNode::Bool(b) => FieldValue::Bool(*b),
            RecordNode::Map(_) | RecordNode::Array(_) | RecordNode::Null => FieldValue::Absent,
        }
    }
}

struct RecordNodeVisitor;

impl<'de> Visitor<'de> for RecordNodeVisitor {
    type Value = RecordNode;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a MaxMind DB data value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<RecordNode, E> {
        Ok(RecordNode::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<RecordNode, E> {
        Ok(RecordNode::Signed(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<RecordNode, E> {
        Ok(RecordNode::Unsigned(u128::from(v)))
    }

    fn visit_u128<E: de::Error>(self, v: u128) -> Result<RecordNode, E> {
        Ok(RecordNode::Unsigned(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<RecordNode, E> {
        Ok(RecordNode::Double(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<RecordNode, E> {
        Ok(RecordNode::String(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<RecordNode, E> {
        Ok(RecordNode::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<RecordNode, E> {
        Ok(RecordNode::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<RecordNode, E> {
        Ok(RecordNode::Bytes(v))
    }

    fn visit_unit<E: de::Error>(self) -> Result<RecordNode, E> {
        Ok(RecordNode::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<RecordNode, E> {
        Ok(RecordNode::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<RecordNode, D::Error> {
        RecordNode::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<RecordNode, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(RecordNode::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<RecordNode, A::Error> {
        let mut map = FxHashMap::default();
        map.reserve(access.size_hint().unwrap_or(0));
        while let Some((key, value)) = access.next_entry::<String, RecordNode>()? {
            map.insert(key, value);
        }
        Ok(RecordNode::Map(map))
    }
}

impl<'de> Deserialize<'de> for RecordNode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(RecordNodeVisitor)
    }
}

/// A typed value read from a record.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldValue<'a> {
    /// Nothing at this path, or the path ends at a map or array.
    Absent,
    String(&'a str),
    Bytes(&'a [u8]),
    Double(f64),
    Unsigned(u128),
    Signed(i64),
    Bool(bool),
}

impl FieldValue<'_> {
    pub fn is_absent(&self) -> bool {
        matches!(self, FieldValue::Absent)
    }

    /// Render the value the way it is bound to a request variable.
    ///
    /// Doubles always carry exactly five fractional digits; strings are
    /// copied verbatim. Returns `None` for [`FieldValue::Absent`].
    pub fn render(&self) -> Option<String> {
        let rendered = match *self {
            FieldValue::Absent => return None,
            FieldValue::String(s) => s.to_owned(),
            FieldValue::Bytes(b) => b.to_str_lossy().into_owned(),
            FieldValue::Double(d) => format!("{d:.5}"),
            FieldValue::Unsigned(u) => itoa::Buffer::new().format(u).to_owned(),
            FieldValue::Signed(i) => itoa::Buffer::new().format(i).to_owned(),
            FieldValue::Bool(b) => (if b { "1" } else { "0" }).to_owned(),
        };
        Some(rendered)
    }
}

/// Error returned when a configured field path is unusable.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FieldPathError {
    #[error("field path has no segments")]
    Empty,
    #[error("field path has {0} segments, the maximum is {max}", max = MAX_PATH_DEPTH)]
    TooDeep(usize),
}

/// An ordered sequence of keys (or array indices) naming a nested value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Build a path from already separated segments.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, FieldPathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(FieldPathError::Empty);
        }
        if segments.len() > MAX_PATH_DEPTH {
            return Err(FieldPathError::TooDeep(segments.len()));
        }
        Ok(FieldPath { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl FromStr for FieldPath {
    type Err = FieldPathError;

    /// Split `a/b/c` into segments. Empty segments (leading, trailing or
    /// doubled separators) are dropped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldPath::from_segments(s.split(PATH_SEPARATOR).filter(|seg| !seg.is_empty()))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, "{PATH_SEPARATOR}")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

/// The root of a record found for an address.
///
/// Owned by the extraction call that looked it up and dropped when that call
/// returns.
#[derive(Clone, Debug, PartialEq)]
pub struct LocatedEntry {
    root: RecordNode,
}

impl LocatedEntry {
    pub fn new(root: RecordNode) -> Self {
        LocatedEntry { root }
    }

    pub fn root(&self) -> &RecordNode {
        &self.root
    }

    /// Resolve a sequence of segments from the root.
    pub fn resolve<S: AsRef<str>>(&self, segments: &[S]) -> FieldValue<'_> {
        let mut node = &self.root;
        for segment in segments {
            match node.child(segment.as_ref()) {
                Some(next) => node = next,
                None => return FieldValue::Absent,
            }
        }
        node.as_value()
    }

    /// Resolve a configured field path from the root.
    #[inline]
    pub fn get(&self, path: &FieldPath) -> FieldValue<'_> {
        self.resolve(path.segments())
    }
}
