//! Binary encoding of protocol values
//!
//! All integers are big-endian. Strings carry an `i32` byte length, `-1`
//! standing for "none". Object ids are one tag byte followed by a LEB128
//! varint. Deltas are written as a tag byte followed by the feature
//! descriptor and the payload of the variant.

use crate::core::error::{ProtocolError, Result};
use crate::core::types::{
    BranchId, BranchPoint, ClassId, Feature, FeatureId, FeatureKind, ObjectId, Timestamp, Value, ValueType,
    Version,
};
use crate::delta::{DeltaType, FeatureDelta, ListFeatureDelta, RevisionDelta};
use crate::revision::{FeatureValue, Revision};
use crate::server::{Invalidation, ViewKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const ID_NULL: u8 = 0;
const ID_TEMP: u8 = 1;
const ID_PERSISTENT: u8 = 2;

const SLOT_SINGLE: u8 = 0;
const SLOT_LIST: u8 = 1;

/// Longest LEB128 encoding of a u64
const MAX_VARINT_LEN: usize = 10;

/// Growable output buffer
#[derive(Debug, Default)]
pub struct DataOutput {
    buf: BytesMut,
}

impl DataOutput {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Create a buffer with preallocated capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: BytesMut::with_capacity(capacity) }
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing was written
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish writing
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    /// Append already encoded bytes
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Write one byte
    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    /// Write a bool as one byte
    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    /// Write a big-endian u16
    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    /// Write a big-endian i32
    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    /// Write a big-endian u32
    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    /// Write a big-endian i64
    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    /// Collection size prefix
    pub fn write_count(&mut self, count: usize) {
        self.buf.put_i32(count as i32);
    }

    /// Write an unsigned LEB128 varint
    pub fn write_varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.put_u8((value as u8) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
    }

    /// Write a length-prefixed byte string
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_count(bytes.len());
        self.buf.put_slice(bytes);
    }

    /// Write an optional string; `None` and empty stay distinct
    pub fn write_string(&mut self, value: Option<&str>) {
        match value {
            Some(s) => self.write_bytes(s.as_bytes()),
            None => self.buf.put_i32(-1),
        }
    }

    /// Write a present string
    pub fn write_str(&mut self, value: &str) {
        self.write_string(Some(value));
    }

    /// Write an object id
    pub fn write_object_id(&mut self, id: ObjectId) {
        match id {
            ObjectId::Null => self.write_u8(ID_NULL),
            ObjectId::Temp(value) => {
                self.write_u8(ID_TEMP);
                self.write_varint(value as u64);
            }
            ObjectId::Persistent(value) => {
                self.write_u8(ID_PERSISTENT);
                self.write_varint(value);
            }
        }
    }

    /// Write a counted list of object ids
    pub fn write_object_ids(&mut self, ids: &[ObjectId]) {
        self.write_count(ids.len());
        for id in ids {
            self.write_object_id(*id);
        }
    }

    /// Write branch and timestamp
    pub fn write_branch_point(&mut self, branch_point: BranchPoint) {
        self.write_i32(branch_point.branch.0);
        self.write_i64(branch_point.timestamp.0);
    }

    /// Write a tagged value
    pub fn write_value(&mut self, value: &Value) {
        self.write_u8(value.value_type() as u8);
        match value {
            Value::Null | Value::Uninitialized => {}
            Value::Bool(v) => self.write_bool(*v),
            Value::Int(v) => self.write_i64(*v),
            Value::Float(v) => self.buf.put_u64(v.to_bits()),
            Value::String(v) => self.write_str(v),
            Value::Bytes(v) => self.write_bytes(v),
            Value::Ref(id) => self.write_object_id(*id),
        }
    }

    /// Write a counted list of values
    pub fn write_values(&mut self, values: &[Value]) {
        self.write_count(values.len());
        for value in values {
            self.write_value(value);
        }
    }

    /// Write a feature descriptor
    pub fn write_feature(&mut self, feature: Feature) {
        self.write_u16(feature.id.0);
        self.write_u8(feature.kind as u8);
        self.write_bool(feature.many);
    }

    /// Write a tagged feature delta
    pub fn write_feature_delta(&mut self, delta: &FeatureDelta) {
        self.write_u8(delta.delta_type() as u8);
        match delta {
            FeatureDelta::Set { feature, index, value } | FeatureDelta::Add { feature, index, value } => {
                self.write_feature(*feature);
                self.write_i32(*index);
                self.write_value(value);
            }
            FeatureDelta::Remove { feature, index } => {
                self.write_feature(*feature);
                self.write_i32(*index);
            }
            FeatureDelta::Move { feature, old_position, new_position } => {
                self.write_feature(*feature);
                self.write_i32(*old_position);
                self.write_i32(*new_position);
            }
            FeatureDelta::List(list) => {
                self.write_feature(list.feature());
                self.write_count(list.list_changes().len());
                for change in list.list_changes() {
                    self.write_feature_delta(change);
                }
            }
            FeatureDelta::Clear { feature } | FeatureDelta::Unset { feature } | FeatureDelta::Noop { feature } => {
                self.write_feature(*feature);
            }
            FeatureDelta::Container { resource, container, containing_feature } => {
                self.write_object_id(*resource);
                self.write_object_id(*container);
                self.write_i32(*containing_feature);
            }
        }
    }

    /// Write a revision delta with its feature deltas
    pub fn write_revision_delta(&mut self, delta: &RevisionDelta) {
        self.write_object_id(delta.id());
        self.write_i32(delta.branch().0);
        self.write_i32(delta.version().0);
        self.write_count(delta.feature_deltas().len());
        for change in delta.feature_deltas() {
            self.write_feature_delta(change);
        }
    }

    /// Write a full revision
    pub fn write_revision(&mut self, revision: &Revision) {
        self.write_object_id(revision.id());
        self.write_u32(revision.class().0);
        self.write_i32(revision.version().0);
        self.write_branch_point(revision.branch_point());
        self.write_i64(revision.revised().0);
        self.write_object_id(revision.resource());
        self.write_object_id(revision.container());
        self.write_i32(revision.containing_feature());

        let slots: Vec<(FeatureId, &FeatureValue)> = revision.values().collect();
        self.write_count(slots.len());
        for (feature, slot) in slots {
            self.write_u16(feature.0);
            match slot {
                FeatureValue::Single(value) => {
                    self.write_u8(SLOT_SINGLE);
                    self.write_value(value);
                }
                FeatureValue::List(values) => {
                    self.write_u8(SLOT_LIST);
                    self.write_values(values);
                }
            }
        }
    }

    /// Write a view kind tag
    pub fn write_view_kind(&mut self, kind: ViewKind) {
        self.write_u8(kind.tag());
        if let ViewKind::Audit(timestamp) = kind {
            self.write_i64(timestamp.0);
        }
    }

    /// Write an invalidation event
    pub fn write_invalidation(&mut self, invalidation: &Invalidation) {
        self.write_i64(invalidation.timestamp.0);
        self.write_i32(invalidation.branch.0);
        self.write_i32(invalidation.committer);
        self.write_object_ids(&invalidation.ids);
    }
}

/// Input buffer with bounds-checked reads. Every failure is a protocol error.
#[derive(Debug, Clone)]
pub struct DataInput {
    buf: Bytes,
}

impl DataInput {
    /// Read from `buf`
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Whether everything was consumed
    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::UnexpectedEof { needed, remaining: self.buf.remaining() }.into());
        }
        Ok(())
    }

    /// Read one byte
    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    /// Read a bool
    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(ProtocolError::InvalidTag { what: "bool", tag: tag as u32 }.into()),
        }
    }

    /// Read a big-endian u16
    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    /// Read a big-endian i32
    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    /// Read a big-endian u32
    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    /// Read a big-endian i64
    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    /// Collection size prefix
    pub fn read_count(&mut self) -> Result<usize> {
        let count = self.read_i32()?;
        usize::try_from(count).map_err(|_| ProtocolError::Malformed("negative count").into())
    }

    /// Read an unsigned LEB128 varint
    pub fn read_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for position in 0..MAX_VARINT_LEN {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u64) << (7 * position);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::Malformed("varint").into())
    }

    /// Read a length-prefixed byte string
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_count()?;
        self.ensure(len)?;
        Ok(self.buf.copy_to_bytes(len).to_vec())
    }

    /// Read an optional string
    pub fn read_string(&mut self) -> Result<Option<String>> {
        let len = self.read_i32()?;
        if len == -1 {
            return Ok(None);
        }
        let len = usize::try_from(len).map_err(|_| ProtocolError::Malformed("string length"))?;
        self.ensure(len)?;
        let bytes = self.buf.copy_to_bytes(len);
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    /// Read a string that must be present
    pub fn read_str(&mut self) -> Result<String> {
        self.read_string()?
            .ok_or_else(|| ProtocolError::Malformed("missing string").into())
    }

    /// Read an object id
    pub fn read_object_id(&mut self) -> Result<ObjectId> {
        match self.read_u8()? {
            ID_NULL => Ok(ObjectId::Null),
            ID_TEMP => {
                let value = self.read_varint()?;
                let value = u32::try_from(value).map_err(|_| ProtocolError::Malformed("temporary id"))?;
                Ok(ObjectId::Temp(value))
            }
            ID_PERSISTENT => Ok(ObjectId::Persistent(self.read_varint()?)),
            tag => Err(ProtocolError::InvalidTag { what: "object id", tag: tag as u32 }.into()),
        }
    }

    /// Read a counted list of object ids
    pub fn read_object_ids(&mut self) -> Result<Vec<ObjectId>> {
        let count = self.read_count()?;
        let mut ids = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            ids.push(self.read_object_id()?);
        }
        Ok(ids)
    }

    /// Read branch and timestamp
    pub fn read_branch_point(&mut self) -> Result<BranchPoint> {
        let branch = BranchId(self.read_i32()?);
        let timestamp = Timestamp(self.read_i64()?);
        Ok(BranchPoint::new(branch, timestamp))
    }

    /// Read a tagged value
    pub fn read_value(&mut self) -> Result<Value> {
        let tag = self.read_u8()?;
        let value_type =
            ValueType::from_u8(tag).ok_or(ProtocolError::InvalidTag { what: "value", tag: tag as u32 })?;
        Ok(match value_type {
            ValueType::Null => Value::Null,
            ValueType::Bool => Value::Bool(self.read_bool()?),
            ValueType::Int => Value::Int(self.read_i64()?),
            ValueType::Float => {
                self.ensure(8)?;
                Value::Float(f64::from_bits(self.buf.get_u64()))
            }
            ValueType::String => Value::string(self.read_str()?),
            ValueType::Bytes => Value::Bytes(self.read_bytes()?),
            ValueType::Ref => Value::Ref(self.read_object_id()?),
            ValueType::Uninitialized => Value::Uninitialized,
        })
    }

    /// Read a counted list of values
    pub fn read_values(&mut self) -> Result<Vec<Value>> {
        let count = self.read_count()?;
        let mut values = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            values.push(self.read_value()?);
        }
        Ok(values)
    }

    /// Read a feature descriptor
    pub fn read_feature(&mut self) -> Result<Feature> {
        let id = FeatureId(self.read_u16()?);
        let tag = self.read_u8()?;
        let kind =
            FeatureKind::from_u8(tag).ok_or(ProtocolError::InvalidTag { what: "feature kind", tag: tag as u32 })?;
        let many = self.read_bool()?;
        Ok(Feature { id, kind, many })
    }

    /// Read one feature delta; a list delta may not contain another list delta
    pub fn read_feature_delta(&mut self) -> Result<FeatureDelta> {
        let delta_type = self.read_delta_type()?;
        self.read_feature_delta_body(delta_type)
    }

    fn read_delta_type(&mut self) -> Result<DeltaType> {
        let tag = self.read_u8()?;
        DeltaType::from_u8(tag).ok_or_else(|| ProtocolError::InvalidTag { what: "feature delta", tag: tag as u32 }.into())
    }

    fn read_feature_delta_body(&mut self, delta_type: DeltaType) -> Result<FeatureDelta> {
        Ok(match delta_type {
            DeltaType::Set => FeatureDelta::Set {
                feature: self.read_feature()?,
                index: self.read_i32()?,
                value: self.read_value()?,
            },
            DeltaType::Add => FeatureDelta::Add {
                feature: self.read_feature()?,
                index: self.read_i32()?,
                value: self.read_value()?,
            },
            DeltaType::Remove => FeatureDelta::Remove {
                feature: self.read_feature()?,
                index: self.read_i32()?,
            },
            DeltaType::Move => FeatureDelta::Move {
                feature: self.read_feature()?,
                old_position: self.read_i32()?,
                new_position: self.read_i32()?,
            },
            DeltaType::List => {
                let feature = self.read_feature()?;
                let count = self.read_count()?;
                let mut changes = Vec::with_capacity(count.min(self.remaining()));
                for _ in 0..count {
                    let nested = self.read_delta_type()?;
                    if nested == DeltaType::List {
                        return Err(ProtocolError::Malformed("nested list delta").into());
                    }
                    changes.push(self.read_feature_delta_body(nested)?);
                }
                FeatureDelta::List(ListFeatureDelta::from_changes(feature, changes))
            }
            DeltaType::Clear => FeatureDelta::Clear { feature: self.read_feature()? },
            DeltaType::Unset => FeatureDelta::Unset { feature: self.read_feature()? },
            DeltaType::Noop => FeatureDelta::Noop { feature: self.read_feature()? },
            DeltaType::Container => FeatureDelta::Container {
                resource: self.read_object_id()?,
                container: self.read_object_id()?,
                containing_feature: self.read_i32()?,
            },
        })
    }

    /// Read a revision delta
    pub fn read_revision_delta(&mut self) -> Result<RevisionDelta> {
        let id = self.read_object_id()?;
        let branch = BranchId(self.read_i32()?);
        let version = Version(self.read_i32()?);
        let count = self.read_count()?;
        let mut changes = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            changes.push(self.read_feature_delta()?);
        }
        Ok(RevisionDelta::from_parts(id, branch, version, changes))
    }

    /// Read a full revision
    pub fn read_revision(&mut self) -> Result<Revision> {
        let id = self.read_object_id()?;
        let class = ClassId(self.read_u32()?);
        let mut revision = Revision::new(id, class);
        revision.set_version(Version(self.read_i32()?));
        revision.set_branch_point(self.read_branch_point()?);
        revision.set_revised(Timestamp(self.read_i64()?));
        let resource = self.read_object_id()?;
        let container = self.read_object_id()?;
        let containing_feature = self.read_i32()?;
        revision.set_container(resource, container, containing_feature);

        let count = self.read_count()?;
        for _ in 0..count {
            let feature = FeatureId(self.read_u16()?);
            match self.read_u8()? {
                SLOT_SINGLE => revision.set(feature, self.read_value()?),
                SLOT_LIST => revision.set_list(feature, self.read_values()?),
                tag => return Err(ProtocolError::InvalidTag { what: "feature slot", tag: tag as u32 }.into()),
            }
        }
        Ok(revision)
    }

    /// Read a view kind tag
    pub fn read_view_kind(&mut self) -> Result<ViewKind> {
        match self.read_u8()? {
            0 => Ok(ViewKind::ReadOnly),
            1 => Ok(ViewKind::Audit(Timestamp(self.read_i64()?))),
            2 => Ok(ViewKind::Transaction),
            tag => Err(ProtocolError::InvalidTag { what: "view kind", tag: tag as u32 }.into()),
        }
    }

    /// Read an invalidation event
    pub fn read_invalidation(&mut self) -> Result<Invalidation> {
        Ok(Invalidation {
            timestamp: Timestamp(self.read_i64()?),
            branch: BranchId(self.read_i32()?),
            committer: self.read_i32()?,
            ids: self.read_object_ids()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Error;
    use crate::delta::NO_INDEX;
    use proptest::prelude::*;

    const NAME: Feature = Feature::attribute(1);
    const TAGS: Feature = Feature::attribute_list(2);
    const CHILDREN: Feature = Feature::reference_list(3);

    fn round_trip<T>(write: impl FnOnce(&mut DataOutput), read: impl FnOnce(&mut DataInput) -> Result<T>) -> T {
        let mut output = DataOutput::new();
        write(&mut output);
        let mut input = DataInput::new(output.freeze());
        let value = read(&mut input).unwrap();
        assert!(input.is_empty(), "{} bytes left over", input.remaining());
        value
    }

    fn base_revision() -> Revision {
        let mut revision = Revision::new(ObjectId::Persistent(10), ClassId(4));
        revision.set_version(Version(3));
        revision.set_branch_point(BranchPoint::new(BranchId::MAIN, Timestamp(1_000)));
        revision.set(NAME.id, Value::from("before"));
        revision.set_list(TAGS.id, vec![Value::from("a"), Value::from("b"), Value::from("c")]);
        revision.set_list(CHILDREN.id, vec![Value::Ref(ObjectId::Persistent(20))]);
        revision
    }

    #[test]
    fn object_ids_are_compact() {
        let mut output = DataOutput::new();
        output.write_object_id(ObjectId::Persistent(5));
        output.write_object_id(ObjectId::Persistent(300));
        output.write_object_id(ObjectId::Null);
        assert_eq!(&output.freeze()[..], &[2, 5, 2, 0xac, 0x02, 0]);
    }

    #[test]
    fn strings_distinguish_none_from_empty() {
        let (none, empty) = round_trip(
            |out| {
                out.write_string(None);
                out.write_string(Some(""));
            },
            |input| Ok((input.read_string()?, input.read_string()?)),
        );
        assert_eq!(none, None);
        assert_eq!(empty.as_deref(), Some(""));
    }

    #[test]
    fn revision_survives_the_wire_including_lazy_slots() {
        let mut revision = base_revision();
        revision.set_container(ObjectId::Persistent(1), ObjectId::Persistent(2), 7);
        revision.list_mut(CHILDREN.id).push(Value::Uninitialized);
        revision.set(FeatureId(9), Value::Float(2.5));
        revision.set(FeatureId(10), Value::Bytes(vec![1, 2, 3]));

        let decoded = round_trip(|out| out.write_revision(&revision), DataInput::read_revision);
        assert_eq!(decoded, revision);
    }

    #[test]
    fn invalidation_survives_the_wire() {
        let event = Invalidation {
            timestamp: Timestamp(77),
            branch: BranchId(2),
            committer: 5,
            ids: vec![ObjectId::Persistent(1), ObjectId::Persistent(1 << 40)],
        };
        let decoded = round_trip(|out| out.write_invalidation(&event), DataInput::read_invalidation);
        assert_eq!(decoded, event);
    }

    #[test]
    fn truncated_input_is_a_protocol_error() {
        let mut output = DataOutput::new();
        output.write_revision_delta(&RevisionDelta::for_version(ObjectId::Persistent(1), BranchId::MAIN, Version(1)));
        let bytes = output.freeze();
        let mut input = DataInput::new(bytes.slice(..bytes.len() - 1));
        let err = input.read_revision_delta().unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::UnexpectedEof { .. })));
        assert!(err.is_fatal_to_session());
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let mut input = DataInput::new(Bytes::from_static(&[42]));
        assert!(matches!(
            input.read_feature_delta(),
            Err(Error::Protocol(ProtocolError::InvalidTag { what: "feature delta", tag: 42 }))
        ));

        let mut input = DataInput::new(Bytes::from_static(&[0xff, 0xff, 0xff, 0xfe]));
        assert!(matches!(input.read_count(), Err(Error::Protocol(ProtocolError::Malformed(_)))));
    }

    #[test]
    fn deeply_nested_list_deltas_are_rejected() {
        let mut output = DataOutput::new();
        for _ in 0..100_000 {
            output.write_u8(DeltaType::List as u8);
            output.write_feature(TAGS);
            output.write_count(1);
        }
        output.write_u8(DeltaType::Clear as u8);
        output.write_feature(TAGS);

        let err = DataInput::new(output.freeze()).read_feature_delta().unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::Malformed("nested list delta"))));
        assert!(err.is_fatal_to_session());
    }

    #[test]
    fn decoded_delta_applies_like_the_original() {
        let base = base_revision();
        let mut delta = RevisionDelta::new(&base);
        delta.add_feature_delta(FeatureDelta::Set { feature: NAME, index: NO_INDEX, value: "after".into() });
        delta.add_feature_delta(FeatureDelta::Add { feature: TAGS, index: 3, value: "d".into() });
        delta.add_feature_delta(FeatureDelta::Remove { feature: TAGS, index: 0 });
        delta.add_feature_delta(FeatureDelta::Move { feature: TAGS, old_position: 2, new_position: 0 });
        delta.add_feature_delta(FeatureDelta::Add {
            feature: CHILDREN,
            index: 0,
            value: Value::Ref(ObjectId::Persistent(21)),
        });
        delta.add_feature_delta(FeatureDelta::Container {
            resource: ObjectId::Persistent(1),
            container: ObjectId::Null,
            containing_feature: 0,
        });

        let decoded = round_trip(|out| out.write_revision_delta(&delta), DataInput::read_revision_delta);
        assert_eq!(decoded, delta);

        let expected = base.apply_delta(&delta).unwrap();
        let actual = base.apply_delta(&decoded).unwrap();
        assert_eq!(actual, expected);
        assert_eq!(actual.list(TAGS.id), &[Value::from("d"), Value::from("b"), Value::from("c")]);
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            any::<f64>().prop_map(Value::Float),
            "[a-z]{0,8}".prop_map(|s| Value::string(s)),
            any::<u64>().prop_map(|id| Value::Ref(ObjectId::Persistent(id))),
            any::<u32>().prop_map(|id| Value::Ref(ObjectId::Temp(id))),
        ]
    }

    proptest! {
        #[test]
        fn appended_tags_apply_identically_after_decoding(
            values in proptest::collection::vec(arb_value(), 0..20),
            removals in proptest::collection::vec(any::<prop::sample::Index>(), 0..5),
        ) {
            let base = base_revision();
            let mut delta = RevisionDelta::new(&base);
            let mut len = base.list(TAGS.id).len();
            for value in values {
                delta.add_feature_delta(FeatureDelta::Add { feature: TAGS, index: len as i32, value });
                len += 1;
            }
            for removal in removals {
                if len == 0 {
                    break;
                }
                delta.add_feature_delta(FeatureDelta::Remove { feature: TAGS, index: removal.index(len) as i32 });
                len -= 1;
            }

            let decoded = round_trip(|out| out.write_revision_delta(&delta), DataInput::read_revision_delta);
            prop_assert_eq!(&decoded, &delta);
            prop_assert_eq!(base.apply_delta(&decoded).unwrap(), base.apply_delta(&delta).unwrap());
        }
    }
}
