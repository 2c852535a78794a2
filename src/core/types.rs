//! Identifier, feature and value types shared by revisions, deltas and the wire codec.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Object identifier.
///
/// Temporary ids are handed out by a client transaction for objects that have
/// not been committed yet; the repository replaces them by persistent ids on commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectId {
    /// Absent reference
    Null,
    /// Provisional id assigned by a client transaction
    Temp(u32),
    /// Permanent id assigned by the repository
    Persistent(u64),
}

impl ObjectId {
    /// Whether this is the null id
    pub fn is_null(&self) -> bool {
        matches!(self, ObjectId::Null)
    }

    /// Whether this id is provisional
    pub fn is_temporary(&self) -> bool {
        matches!(self, ObjectId::Temp(_))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        ObjectId::Null
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Null => write!(f, "NULL"),
            ObjectId::Temp(id) => write!(f, "t{}", id),
            ObjectId::Persistent(id) => write!(f, "L{}", id),
        }
    }
}

/// Revision version number, monotonic along one branch lineage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Version(pub i32);

impl Version {
    /// Version of an object that has never been committed
    pub const UNSPECIFIED: Version = Version(0);
    /// Version of the first committed revision
    pub const FIRST: Version = Version(1);

    /// The version following this one
    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Branch identifier
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BranchId(pub i32);

impl BranchId {
    /// The main branch every repository starts with
    pub const MAIN: BranchId = BranchId(0);
}

/// Milliseconds since the unix epoch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// "No particular point in time": head for reads, "still current" for revised stamps
    pub const UNSPECIFIED: Timestamp = Timestamp(0);

    /// Current wall clock time
    pub fn now() -> Self {
        Timestamp(chrono::Utc::now().timestamp_millis())
    }

    /// Whether this is the unspecified timestamp
    pub fn is_unspecified(&self) -> bool {
        self.0 == 0
    }

    /// The millisecond immediately before this one
    pub fn previous(self) -> Timestamp {
        Timestamp(self.0 - 1)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Branch plus point in time
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchPoint {
    /// Branch of the point
    pub branch: BranchId,
    /// Time on the branch, `UNSPECIFIED` for the branch head
    pub timestamp: Timestamp,
}

impl BranchPoint {
    /// Create a branch point
    pub fn new(branch: BranchId, timestamp: Timestamp) -> Self {
        Self { branch, timestamp }
    }

    /// Head of the main branch
    pub fn main_head() -> Self {
        Self::new(BranchId::MAIN, Timestamp::UNSPECIFIED)
    }
}

/// Class (type) reference of an object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ClassId(pub u32);

/// Feature (field) identifier, unique within a class
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct FeatureId(pub u16);

/// What a feature holds
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureKind {
    /// Plain values
    Attribute = 0,
    /// References to other objects
    Reference = 1,
    /// Heterogeneous feature map entries
    FeatureMap = 2,
}

impl FeatureKind {
    /// Convert a wire byte into a feature kind
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FeatureKind::Attribute),
            1 => Some(FeatureKind::Reference),
            2 => Some(FeatureKind::FeatureMap),
            _ => None,
        }
    }
}

/// Minimal structural feature descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Feature {
    /// Feature id
    pub id: FeatureId,
    /// Value kind
    pub kind: FeatureKind,
    /// Multi-valued (ordered list) feature
    pub many: bool,
}

impl Feature {
    /// Pseudo feature targeted by container deltas
    pub const CONTAINER: Feature = Feature {
        id: FeatureId(u16::MAX),
        kind: FeatureKind::Reference,
        many: false,
    };

    /// Single-valued attribute
    pub const fn attribute(id: u16) -> Self {
        Self { id: FeatureId(id), kind: FeatureKind::Attribute, many: false }
    }

    /// Multi-valued attribute
    pub const fn attribute_list(id: u16) -> Self {
        Self { id: FeatureId(id), kind: FeatureKind::Attribute, many: true }
    }

    /// Single-valued reference
    pub const fn reference(id: u16) -> Self {
        Self { id: FeatureId(id), kind: FeatureKind::Reference, many: false }
    }

    /// Multi-valued reference
    pub const fn reference_list(id: u16) -> Self {
        Self { id: FeatureId(id), kind: FeatureKind::Reference, many: true }
    }

    /// Feature map
    pub const fn feature_map(id: u16) -> Self {
        Self { id: FeatureId(id), kind: FeatureKind::FeatureMap, many: true }
    }

    /// Whether removed entries of this feature carry identity worth releasing
    pub fn is_reference_or_feature_map(&self) -> bool {
        matches!(self.kind, FeatureKind::Reference | FeatureKind::FeatureMap)
    }
}

/// Value held by a feature slot or list entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point
    Float(f64),
    /// String value
    String(Arc<str>),
    /// Binary data
    Bytes(Vec<u8>),
    /// Reference to another object
    Ref(ObjectId),
    /// Lazy list slot that has not been loaded yet
    Uninitialized,
}

impl Value {
    /// Build a string value
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::String(Arc::from(s.as_ref()))
    }

    /// Whether this is the lazy-loading sentinel
    pub fn is_uninitialized(&self) -> bool {
        matches!(self, Value::Uninitialized)
    }

    /// Referenced object id, if this is a reference
    pub fn as_ref_id(&self) -> Option<ObjectId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Wire tag of this value
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::String(_) => ValueType::String,
            Value::Bytes(_) => ValueType::Bytes,
            Value::Ref(_) => ValueType::Ref,
            Value::Uninitialized => ValueType::Uninitialized,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            // Bitwise so that Eq and Hash stay consistent
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            (Value::Uninitialized, Value::Uninitialized) => true,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.value_type() as u8).hash(state);
        match self {
            Value::Null | Value::Uninitialized => {}
            Value::Bool(v) => v.hash(state),
            Value::Int(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::String(v) => v.hash(state),
            Value::Bytes(v) => v.hash(state),
            Value::Ref(v) => v.hash(state),
        }
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::Ref(id)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Wire format type identifiers - one-to-one with Value variants
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Null value
    Null = 0,
    /// Boolean value
    Bool = 1,
    /// i64 integer
    Int = 2,
    /// f64 float
    Float = 3,
    /// UTF-8 string
    String = 16,
    /// Binary data
    Bytes = 17,
    /// Object reference
    Ref = 128,
    /// Lazy list slot
    Uninitialized = 255,
}

impl ValueType {
    /// Convert a u8 value to ValueType
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ValueType::Null),
            1 => Some(ValueType::Bool),
            2 => Some(ValueType::Int),
            3 => Some(ValueType::Float),
            16 => Some(ValueType::String),
            17 => Some(ValueType::Bytes),
            128 => Some(ValueType::Ref),
            255 => Some(ValueType::Uninitialized),
            _ => None,
        }
    }
}

/// Session identifier assigned by the session manager
pub type SessionId = i32;

/// View identifier, unique within one session
pub type ViewId = i32;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn shared_strings_serialize_by_content() {
        #[derive(Serialize, Deserialize)]
        struct Holder {
            value: Value,
        }

        let text = toml::to_string(&Holder { value: Value::from("alice") }).unwrap();
        assert!(text.contains("alice"));
        let decoded: Holder = toml::from_str(&text).unwrap();
        assert_eq!(decoded.value, Value::from("alice"));
    }

    #[test]
    fn float_values_compare_bitwise() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));

        let mut set = HashSet::new();
        set.insert(Value::Float(1.5));
        assert!(set.contains(&Value::Float(1.5)));
    }

    #[test]
    fn feature_kind_byte_mapping() {
        for kind in [FeatureKind::Attribute, FeatureKind::Reference, FeatureKind::FeatureMap] {
            assert_eq!(FeatureKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(FeatureKind::from_u8(9), None);
    }

    #[test]
    fn object_id_display() {
        assert_eq!(ObjectId::Persistent(42).to_string(), "L42");
        assert_eq!(ObjectId::Temp(3).to_string(), "t3");
        assert!(ObjectId::Temp(3).is_temporary());
    }
}
