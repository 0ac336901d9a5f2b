//! Record and document serializer for the server's compact binary format.
//!
//! A serialized record is `version (u8) || class || field table || data`.
//! Field-table entries are either name-tagged (schemaless classes) or
//! global-property references that resolve name through the session schema.
//! Offsets in a field table are absolute within the document's own frame:
//! the top-level frame includes the leading version byte, while an embedded
//! document or map is its own frame, which keeps every nested structure
//! independently decodable.

use crate::support::{WireError, WireResult};
use crate::wire::{self, Reader};
use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;
use indexmap::IndexMap;
use std::fmt;

/// Serializer revision this codec understands.
pub const SERIALIZER_VERSION: u8 = 0;

/// Record identifier: physical cluster plus position within it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Rid {
    pub cluster: i16,
    pub position: i64,
}

impl Rid {
    #[inline]
    pub fn new(cluster: i16, position: i64) -> Rid {
        Rid { cluster, position }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "#{}:{}", self.cluster, self.position)
    }
}

/// Wire type codes, stable with the server.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum OType {
    Boolean,
    Integer,
    Short,
    Long,
    Float,
    Double,
    DateTime,
    String,
    Binary,
    Embedded,
    EmbeddedList,
    EmbeddedSet,
    EmbeddedMap,
    Link,
    LinkList,
    LinkSet,
    LinkMap,
    Byte,
    Date,
    Decimal,
    Any,
}

impl OType {
    pub fn code(self) -> u8 {
        match self {
            OType::Boolean => 0,
            OType::Integer => 1,
            OType::Short => 2,
            OType::Long => 3,
            OType::Float => 4,
            OType::Double => 5,
            OType::DateTime => 6,
            OType::String => 7,
            OType::Binary => 8,
            OType::Embedded => 9,
            OType::EmbeddedList => 10,
            OType::EmbeddedSet => 11,
            OType::EmbeddedMap => 12,
            OType::Link => 13,
            OType::LinkList => 14,
            OType::LinkSet => 15,
            OType::LinkMap => 16,
            OType::Byte => 17,
            OType::Date => 19,
            OType::Decimal => 21,
            OType::Any => 23,
        }
    }

    pub fn from_code(code: u8) -> WireResult<OType> {
        Ok(match code {
            0 => OType::Boolean,
            1 => OType::Integer,
            2 => OType::Short,
            3 => OType::Long,
            4 => OType::Float,
            5 => OType::Double,
            6 => OType::DateTime,
            7 => OType::String,
            8 => OType::Binary,
            9 => OType::Embedded,
            10 => OType::EmbeddedList,
            11 => OType::EmbeddedSet,
            12 => OType::EmbeddedMap,
            13 => OType::Link,
            14 => OType::LinkList,
            15 => OType::LinkSet,
            16 => OType::LinkMap,
            17 => OType::Byte,
            19 => OType::Date,
            21 => OType::Decimal,
            23 => OType::Any,
            unknown => return Err(WireError::UnknownType(unknown)),
        })
    }

    /// Resolves a schema type name (`"STRING"`, `"INTEGER"`, ...) as sent in
    /// the global-property table.
    pub fn from_name(name: &str) -> Option<OType> {
        Some(match name {
            "BOOLEAN" => OType::Boolean,
            "INTEGER" => OType::Integer,
            "SHORT" => OType::Short,
            "LONG" => OType::Long,
            "FLOAT" => OType::Float,
            "DOUBLE" => OType::Double,
            "DATETIME" => OType::DateTime,
            "STRING" => OType::String,
            "BINARY" => OType::Binary,
            "EMBEDDED" => OType::Embedded,
            "EMBEDDEDLIST" => OType::EmbeddedList,
            "EMBEDDEDSET" => OType::EmbeddedSet,
            "EMBEDDEDMAP" => OType::EmbeddedMap,
            "LINK" => OType::Link,
            "LINKLIST" => OType::LinkList,
            "LINKSET" => OType::LinkSet,
            "LINKMAP" => OType::LinkMap,
            "BYTE" => OType::Byte,
            "DATE" => OType::Date,
            "DECIMAL" => OType::Decimal,
            "ANY" => OType::Any,
            _ => return None,
        })
    }
}

/// Arbitrary-precision decimal carried in wire form: a scale plus the
/// big-endian two's-complement unscaled value.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Decimal {
    pub scale: i32,
    pub unscaled: Vec<u8>,
}

/// A single typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    String(String),
    Bytes(Vec<u8>),
    Embedded(Document),
    List(Vec<Value>),
    Set(Vec<Value>),
    Map(IndexMap<String, Value>),
    Link(Rid),
    LinkList(Vec<Rid>),
    LinkSet(Vec<Rid>),
    LinkMap(IndexMap<String, Rid>),
    /// Milliseconds since the unix epoch.
    DateTime(i64),
    /// Days since the unix epoch (epoch milliseconds divided by 86 400 000).
    Date(i64),
}

impl Value {
    /// Type code written into the field table for this value.
    fn type_code(&self) -> u8 {
        match self {
            Value::Null => OType::Any.code(),
            Value::Bool(_) => OType::Boolean.code(),
            Value::I32(_) => OType::Integer.code(),
            Value::I64(_) => OType::Long.code(),
            Value::F32(_) => OType::Float.code(),
            Value::F64(_) => OType::Double.code(),
            Value::Decimal(_) => OType::Decimal.code(),
            Value::String(_) => OType::String.code(),
            Value::Bytes(_) => OType::Binary.code(),
            Value::Embedded(_) => OType::Embedded.code(),
            Value::List(_) => OType::EmbeddedList.code(),
            Value::Set(_) => OType::EmbeddedSet.code(),
            Value::Map(_) => OType::EmbeddedMap.code(),
            Value::Link(_) => OType::Link.code(),
            Value::LinkList(_) => OType::LinkList.code(),
            Value::LinkSet(_) => OType::LinkSet.code(),
            Value::LinkMap(_) => OType::LinkMap.code(),
            Value::DateTime(_) => OType::DateTime.code(),
            Value::Date(_) => OType::Date.code(),
        }
    }
}

/// A document: class name (possibly empty), ordered field map, and the
/// record identity assigned by the server once persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub class: String,
    fields: IndexMap<String, Value>,
    pub rid: Option<Rid>,
    pub version: i32,
}

impl Document {
    #[inline]
    pub fn new<S: Into<String>>(class: S) -> Document {
        Document {
            class: class.into(),
            fields: IndexMap::new(),
            rid: None,
            version: 0,
        }
    }

    /// Sets a field, preserving first-insertion order.
    #[inline]
    pub fn set<S: Into<String>>(&mut self, name: S, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// Builder-style variant of [`Document::set`].
    #[inline]
    pub fn with<S: Into<String>>(mut self, name: S, value: Value) -> Document {
        self.set(name, value);
        self
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    #[inline]
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Number of fields.
    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A global property declared once on a schemaful class.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GlobalProperty {
    pub name: String,
    pub kind: OType,
}

/// Cached mapping from global property id to its declaration, fetched from
/// the schema record after authentication.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    properties: HashMap<i32, GlobalProperty>,
}

impl Schema {
    #[inline]
    pub fn new() -> Schema {
        Schema {
            properties: HashMap::new(),
        }
    }

    #[inline]
    pub fn insert<S: Into<String>>(&mut self, id: i32, name: S, kind: OType) {
        self.properties.insert(
            id,
            GlobalProperty {
                name: name.into(),
                kind,
            },
        );
    }

    #[inline]
    pub fn property(&self, id: i32) -> Option<&GlobalProperty> {
        self.properties.get(&id)
    }

    /// Number of known global properties.
    #[inline]
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Builds the schema from the `globalProperties` list of the schema
    /// record at `#0:1`.
    pub fn from_document(document: &Document) -> WireResult<Schema> {
        let list = match document.get("globalProperties") {
            Some(Value::List(items)) | Some(Value::Set(items)) => items,
            _ => return Err(WireError::Malformed("schema record has no globalProperties")),
        };

        let mut schema = Schema::new();

        for item in list {
            let entry = match item {
                Value::Embedded(entry) => entry,
                _ => return Err(WireError::Malformed("global property is not a document")),
            };

            let id = match entry.get("id") {
                Some(Value::I32(id)) => *id,
                Some(Value::I64(id)) => *id as i32,
                _ => return Err(WireError::Malformed("global property has no id")),
            };
            let name = match entry.get("name") {
                Some(Value::String(name)) => name.clone(),
                _ => return Err(WireError::Malformed("global property has no name")),
            };
            let kind = match entry.get("type") {
                Some(Value::String(kind)) => OType::from_name(kind)
                    .ok_or(WireError::Malformed("global property type is unknown"))?,
                _ => return Err(WireError::Malformed("global property has no type")),
            };

            schema.insert(id, name, kind);
        }

        Ok(schema)
    }
}

/// Serializes a top-level record, leading serializer-version byte included.
pub fn encode_record(document: &Document) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(SERIALIZER_VERSION);
    encode_frame(document, &mut out, 0);
    out
}

/// Serializes one document frame at the tail of `out`. `origin` is the index
/// in `out` where this frame's offset reference point sits.
fn encode_frame(document: &Document, out: &mut Vec<u8>, origin: usize) {
    wire::put_varint_string(out, &document.class);

    // Field table with placeholder offsets, patched once the data area is
    // laid out.
    let mut slots = Vec::with_capacity(document.len());

    for (name, value) in document.fields() {
        wire::put_varint(out, name.len() as i64);
        out.extend_from_slice(name.as_bytes());
        slots.push(out.len());
        wire::put_i32(out, 0);
        out.push(value.type_code());
    }

    wire::put_varint(out, 0);

    for ((_, value), slot) in document.fields().zip(slots) {
        if let Value::Null = value {
            // A zero offset marks a present-but-null field.
            continue;
        }

        let offset = (out.len() - origin) as i32;
        BigEndian::write_i32(&mut out[slot..slot + 4], offset);
        encode_value(value, out);
    }
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => {}
        Value::Bool(flag) => out.push(*flag as u8),
        Value::I32(number) => wire::put_varint(out, i64::from(*number)),
        Value::I64(number) => wire::put_varint(out, *number),
        Value::F32(number) => wire::put_f32(out, *number),
        Value::F64(number) => wire::put_f64(out, *number),
        Value::DateTime(millis) => wire::put_varint(out, *millis),
        Value::Date(days) => wire::put_varint(out, *days),
        Value::String(text) => wire::put_varint_string(out, text),
        Value::Bytes(raw) => wire::put_varint_bytes(out, raw),
        Value::Embedded(document) => {
            let origin = out.len();
            encode_frame(document, out, origin);
        }
        Value::List(items) | Value::Set(items) => {
            wire::put_varint(out, items.len() as i64);
            out.push(OType::Any.code());

            for item in items {
                out.push(item.type_code());
                encode_value(item, out);
            }
        }
        Value::Map(entries) => encode_map(entries, out),
        Value::Link(rid) => encode_link(rid, out),
        Value::LinkList(rids) | Value::LinkSet(rids) => {
            wire::put_varint(out, rids.len() as i64);

            for rid in rids {
                encode_link(rid, out);
            }
        }
        Value::LinkMap(entries) => {
            wire::put_varint(out, entries.len() as i64);

            for (key, rid) in entries {
                out.push(OType::String.code());
                wire::put_varint_string(out, key);
                encode_link(rid, out);
            }
        }
        Value::Decimal(decimal) => {
            wire::put_i32(out, decimal.scale);
            wire::put_i32(out, decimal.unscaled.len() as i32);
            out.extend_from_slice(&decimal.unscaled);
        }
    }
}

/// An embedded map is its own offset frame: a varint entry count, a header
/// of `(key type || key || offset i32 || value type)` entries, then the
/// value data area. A zero offset marks a null value.
fn encode_map(entries: &IndexMap<String, Value>, out: &mut Vec<u8>) {
    let origin = out.len();
    wire::put_varint(out, entries.len() as i64);

    let mut slots = Vec::with_capacity(entries.len());

    for (key, value) in entries {
        out.push(OType::String.code());
        wire::put_varint_string(out, key);
        slots.push(out.len());
        wire::put_i32(out, 0);
        out.push(value.type_code());
    }

    for ((_, value), slot) in entries.iter().zip(slots) {
        if let Value::Null = value {
            continue;
        }

        let offset = (out.len() - origin) as i32;
        BigEndian::write_i32(&mut out[slot..slot + 4], offset);
        encode_value(value, out);
    }
}

#[inline]
fn encode_link(rid: &Rid, out: &mut Vec<u8>) {
    wire::put_varint(out, i64::from(rid.cluster));
    wire::put_varint(out, rid.position);
}

/// Deserializes a top-level record frame. The slice must hold the complete
/// record; `schema` resolves global-property references and may be `None`
/// for schemaless content such as the schema record itself.
pub fn decode_record(frame: &[u8], schema: Option<&Schema>) -> WireResult<Document> {
    let mut reader = Reader::new(frame);

    if reader.read_u8()? != SERIALIZER_VERSION {
        return Err(WireError::Malformed("unsupported serializer version"));
    }

    let (document, _) = decode_frame(frame, 1, schema)?;
    Ok(document)
}

struct FieldEntry {
    name: String,
    offset: usize,
    code: u8,
}

/// Decodes one document frame. Offsets index into `frame` directly; `start`
/// is where the class name begins within it. Returns the document plus the
/// end of the consumed region, which lets inline (list-element) documents be
/// parsed sequentially.
fn decode_frame(
    frame: &[u8],
    start: usize,
    schema: Option<&Schema>,
) -> WireResult<(Document, usize)> {
    if start > frame.len() {
        return Err(WireError::Wait);
    }

    let mut reader = Reader::new(&frame[start..]);
    let class = reader.read_varint_string()?;

    let mut entries = Vec::new();

    loop {
        let key = reader.read_varint()?;

        if key == 0 {
            break;
        }

        if key > 0 {
            // Name-tagged field. This branch must never consult the schema:
            // the schema record itself is decoded through it.
            let raw = reader.read_exact(key as usize)?;
            let name = std::str::from_utf8(raw).map_err(|_| WireError::Utf8)?.to_string();
            let offset = reader.read_i32()?;
            let code = reader.read_u8()?;

            entries.push(FieldEntry {
                name,
                offset: offset as usize,
                code,
            });
        } else {
            let id = (-key - 1) as i32;
            let offset = reader.read_i32()?;
            let code = reader.read_u8()?;

            let property = schema
                .and_then(|schema| schema.property(id))
                .ok_or(WireError::UnknownPropertyId(id))?;

            entries.push(FieldEntry {
                name: property.name.clone(),
                offset: offset as usize,
                code,
            });
        }
    }

    let mut end = start + reader.position();
    let mut document = Document::new(class);

    for entry in entries {
        if entry.offset == 0 {
            document.set(entry.name, Value::Null);
            continue;
        }

        let (value, value_end) = decode_value(frame, entry.offset, entry.code, schema)?;
        end = end.max(value_end);
        document.set(entry.name, value);
    }

    Ok((document, end))
}

/// Decodes a single value of type `code` starting at `frame[at]`. Returns
/// the value and the absolute end of its encoding within `frame`.
fn decode_value(
    frame: &[u8],
    at: usize,
    code: u8,
    schema: Option<&Schema>,
) -> WireResult<(Value, usize)> {
    if at > frame.len() {
        return Err(WireError::Wait);
    }

    let kind = OType::from_code(code)?;
    let sub = &frame[at..];
    let mut reader = Reader::new(sub);

    let value = match kind {
        OType::Any => return Ok((Value::Null, at)),
        OType::Boolean => Value::Bool(reader.read_u8()? != 0),
        OType::Integer | OType::Short => Value::I32(reader.read_varint()? as i32),
        OType::Byte => Value::I32(i32::from(reader.read_i8()?)),
        OType::Long => Value::I64(reader.read_varint()?),
        OType::Float => Value::F32(reader.read_f32()?),
        OType::Double => Value::F64(reader.read_f64()?),
        OType::DateTime => Value::DateTime(reader.read_varint()?),
        OType::Date => Value::Date(reader.read_varint()?),
        OType::String => Value::String(reader.read_varint_string()?),
        OType::Binary => Value::Bytes(reader.read_varint_bytes()?.to_vec()),
        OType::Embedded => {
            let (document, end) = decode_frame(sub, 0, schema)?;
            return Ok((Value::Embedded(document), at + end));
        }
        OType::EmbeddedList | OType::EmbeddedSet => {
            let count = read_count(&mut reader)?;
            let _element_kind = reader.read_u8()?;
            let mut position = at + reader.position();
            let mut items = Vec::with_capacity(count);

            for _ in 0..count {
                let item_code = match frame.get(position) {
                    Some(&code) => code,
                    None => return Err(WireError::Wait),
                };
                position += 1;

                if item_code == OType::Any.code() {
                    items.push(Value::Null);
                    continue;
                }

                let (item, item_end) = decode_value(frame, position, item_code, schema)?;
                items.push(item);
                position = item_end;
            }

            let value = match kind {
                OType::EmbeddedList => Value::List(items),
                _ => Value::Set(items),
            };
            return Ok((value, position));
        }
        OType::EmbeddedMap => return decode_map(frame, at, schema),
        OType::Link => Value::Link(read_link(&mut reader)?),
        OType::LinkList | OType::LinkSet => {
            let count = read_count(&mut reader)?;
            let mut rids = Vec::with_capacity(count);

            for _ in 0..count {
                rids.push(read_link(&mut reader)?);
            }

            match kind {
                OType::LinkList => Value::LinkList(rids),
                _ => Value::LinkSet(rids),
            }
        }
        OType::LinkMap => {
            let count = read_count(&mut reader)?;
            let mut entries = IndexMap::with_capacity(count);

            for _ in 0..count {
                if reader.read_u8()? != OType::String.code() {
                    return Err(WireError::Malformed("link map key must be a string"));
                }

                let key = reader.read_varint_string()?;
                entries.insert(key, read_link(&mut reader)?);
            }

            Value::LinkMap(entries)
        }
        OType::Decimal => {
            let scale = reader.read_i32()?;
            let length = reader.read_i32()?;

            if length < 0 {
                return Err(WireError::Malformed("negative decimal length"));
            }

            Value::Decimal(Decimal {
                scale,
                unscaled: reader.read_exact(length as usize)?.to_vec(),
            })
        }
    };

    Ok((value, at + reader.position()))
}

fn decode_map(frame: &[u8], at: usize, schema: Option<&Schema>) -> WireResult<(Value, usize)> {
    let sub = &frame[at..];
    let mut reader = Reader::new(sub);

    let count = read_count(&mut reader)?;
    let mut headers = Vec::with_capacity(count);

    for _ in 0..count {
        if reader.read_u8()? != OType::String.code() {
            return Err(WireError::Malformed("map key must be a string"));
        }

        let key = reader.read_varint_string()?;
        let offset = reader.read_i32()?;
        let code = reader.read_u8()?;
        headers.push((key, offset as usize, code));
    }

    let mut end = reader.position();
    let mut entries = IndexMap::with_capacity(count);

    for (key, offset, code) in headers {
        if offset == 0 {
            entries.insert(key, Value::Null);
            continue;
        }

        // Offsets are relative to the map's own frame.
        let (value, value_end) = decode_value(sub, offset, code, schema)?;
        end = end.max(value_end);
        entries.insert(key, value);
    }

    Ok((Value::Map(entries), at + end))
}

#[inline]
fn read_count(reader: &mut Reader) -> WireResult<usize> {
    let count = reader.read_varint()?;

    if count < 0 {
        return Err(WireError::Malformed("negative collection count"));
    }

    Ok(count as usize)
}

#[inline]
fn read_link(reader: &mut Reader) -> WireResult<Rid> {
    let cluster = reader.read_varint()?;
    let position = reader.read_varint()?;
    Ok(Rid::new(cluster as i16, position))
}
