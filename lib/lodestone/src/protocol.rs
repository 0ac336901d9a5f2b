//! Per-operation request encoders and response decoders.
//!
//! A request frame is `op (u8) || session_id (i32) || args`; every response
//! begins `status (u8) || session_id (i32)`. Each decoder is restartable:
//! [`WireError::Wait`] consumes nothing observable, so the session can stash
//! the bytes and retry once more of the stream has arrived.

use crate::options::DbKind;
use crate::record::{self, Document, Rid, Schema};
use crate::support::{DriverError, WireError, WireResult};
use crate::wire::{self, Reader};

pub const STATUS_OK: u8 = 0;
pub const STATUS_ERROR: u8 = 1;
pub const STATUS_PUSH: u8 = 3;

/// Record kind byte for documents; raw (`'b'`) and flat (`'f'`) records are
/// not produced by this driver.
pub const RECORD_KIND_DOCUMENT: u8 = b'd';

// tx_commit entry kinds.
const TX_UPDATE: u8 = 1;
const TX_DELETE: u8 = 2;
const TX_CREATE: u8 = 3;

/// Session scope an operation belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Scope {
    Server,
    Database,
}

/// Protocol operations, named after the server's request codes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Op {
    Shutdown,
    Connect,
    DbOpen,
    DbCreate,
    DbClose,
    DbExist,
    DbDrop,
    DbSize,
    DbCountRecords,
    RecordLoad,
    RecordCreate,
    RecordUpdate,
    RecordDelete,
    Command,
    RecordLoadIfVersionNotLatest,
    TxCommit,
    DbReload,
    DbList,
}

impl Op {
    pub fn code(self) -> u8 {
        match self {
            Op::Shutdown => 1,
            Op::Connect => 2,
            Op::DbOpen => 3,
            Op::DbCreate => 4,
            Op::DbClose => 5,
            Op::DbExist => 6,
            Op::DbDrop => 7,
            Op::DbSize => 8,
            Op::DbCountRecords => 9,
            Op::RecordLoad => 30,
            Op::RecordCreate => 31,
            Op::RecordUpdate => 32,
            Op::RecordDelete => 33,
            Op::Command => 41,
            Op::RecordLoadIfVersionNotLatest => 44,
            Op::TxCommit => 60,
            Op::DbReload => 73,
            Op::DbList => 74,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Op::Shutdown => "shutdown",
            Op::Connect => "connect",
            Op::DbOpen => "db_open",
            Op::DbCreate => "db_create",
            Op::DbClose => "db_close",
            Op::DbExist => "db_exist",
            Op::DbDrop => "db_drop",
            Op::DbSize => "db_size",
            Op::DbCountRecords => "db_countrecords",
            Op::RecordLoad => "record_load",
            Op::RecordCreate => "record_create",
            Op::RecordUpdate => "record_update",
            Op::RecordDelete => "record_delete",
            Op::Command => "command",
            Op::RecordLoadIfVersionNotLatest => "record_load_if_version_not_latest",
            Op::TxCommit => "tx_commit",
            Op::DbReload => "db_reload",
            Op::DbList => "db_list",
        }
    }

    /// Scope the operation is valid in. `None` marks the handshake
    /// operations, which only the session itself may issue.
    pub fn scope(self) -> Option<Scope> {
        match self {
            Op::Connect | Op::DbOpen => None,
            Op::Shutdown | Op::DbCreate | Op::DbExist | Op::DbDrop | Op::DbList => {
                Some(Scope::Server)
            }
            _ => Some(Scope::Database),
        }
    }
}

/// One element of the typed argument stream a request is encoded from.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Raw(Vec<u8>),
    Short(i16),
    Int(i32),
    Long(i64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Rid(Rid),
    Record(Document),
    /// Placeholder the session replaces with a freshly allocated
    /// transaction id on `tx_commit`.
    TransactionId,
}

/// Encodes a request frame at the tail of `out`.
pub fn encode_request(op: Op, session_id: i32, args: &[Arg], out: &mut Vec<u8>) {
    wire::put_u8(out, op.code());
    wire::put_i32(out, session_id);

    for arg in args {
        encode_arg(arg, out);
    }
}

fn encode_arg(arg: &Arg, out: &mut Vec<u8>) {
    match arg {
        Arg::Raw(bytes) => out.extend_from_slice(bytes),
        Arg::Short(value) => wire::put_i16(out, *value),
        Arg::Int(value) => wire::put_i32(out, *value),
        Arg::Long(value) => wire::put_i64(out, *value),
        Arg::Bool(value) => wire::put_bool(out, *value),
        Arg::Str(value) => wire::put_string(out, value),
        Arg::Bytes(value) => wire::put_bytes(out, value),
        Arg::Rid(rid) => {
            wire::put_i16(out, rid.cluster);
            wire::put_i64(out, rid.position);
        }
        Arg::Record(document) => wire::put_bytes(out, &record::encode_record(document)),
        // An unsubstituted placeholder encodes as the unset id.
        Arg::TransactionId => wire::put_i32(out, -1),
    }
}

/// Argument stream for the server-scope `connect` handshake.
pub fn connect_args(user: &str, password: &str) -> Vec<Arg> {
    let mut args = handshake_prologue();
    args.push(Arg::Str(user.to_string()));
    args.push(Arg::Str(password.to_string()));
    args
}

/// Argument stream for the database-scope `db_open` handshake.
pub fn db_open_args(name: &str, kind: DbKind, user: &str, password: &str) -> Vec<Arg> {
    let mut args = handshake_prologue();
    args.push(Arg::Str(name.to_string()));
    args.push(Arg::Str(kind.as_str().to_string()));
    args.push(Arg::Str(user.to_string()));
    args.push(Arg::Str(password.to_string()));
    args
}

fn handshake_prologue() -> Vec<Arg> {
    vec![
        Arg::Str(crate::DRIVER_NAME.to_string()),
        Arg::Str(crate::DRIVER_VERSION.to_string()),
        Arg::Short(crate::PROTOCOL as i16),
        Arg::Str(String::new()), // client id
        Arg::Str(crate::SERIALIZER.to_string()),
        Arg::Bool(false), // token-based auth
    ]
}

/// A cluster as announced in the `db_open` and `db_reload` payloads.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Cluster {
    pub name: String,
    pub id: i16,
}

/// A record carried in a response payload.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedRecord {
    pub rid: Option<Rid>,
    pub version: i32,
    pub document: Document,
}

/// Payload of a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOpened {
    pub token: Option<Vec<u8>>,
    pub clusters: Vec<Cluster>,
    pub cluster_config: Option<Vec<u8>>,
    pub release: Option<String>,
}

/// Result of a synchronous `command` call.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    None,
    Record(FetchedRecord),
    Collection(Vec<FetchedRecord>),
    Scalar(String),
}

/// Decoded success payload of an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpResponse {
    Unit,
    Exists(bool),
    Deleted(bool),
    Count(i64),
    Opened(SessionOpened),
    Clusters(Vec<Cluster>),
    Databases(Document),
    Records(Vec<FetchedRecord>),
    Created { rid: Rid, version: i32 },
    Updated { version: i32 },
    Command(CommandResult),
    TxCommitted {
        created: Vec<(Rid, Rid)>,
        updated: Vec<(Rid, i32)>,
    },
}

/// A fully framed response: the echoed (or, on handshake, newly issued)
/// session id plus either the decoded payload or the per-call failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub session_id: i32,
    pub body: Result<OpResponse, DriverError>,
}

/// Decodes one response frame for `op` from the head of `buf`. Returns the
/// response and the number of bytes consumed, or [`WireError::Wait`] when
/// the frame is not complete yet.
pub fn decode_response(
    op: Op,
    buf: &[u8],
    schema: Option<&Schema>,
) -> WireResult<(Response, usize)> {
    let mut reader = Reader::new(buf);
    let status = reader.read_u8()?;
    let session_id = reader.read_i32()?;

    let body = match status {
        STATUS_OK => decode_payload(op, &mut reader, schema)?,
        STATUS_ERROR => Err(decode_error_frame(&mut reader)?),
        _ => return Err(WireError::Malformed("unknown response status")),
    };

    Ok((Response { session_id, body }, reader.position()))
}

/// Decodes and discards a push frame (`status 3 || i32 || bytes`). Push
/// notifications do not belong to any pipeline slot.
pub fn decode_push(buf: &[u8]) -> WireResult<usize> {
    let mut reader = Reader::new(buf);

    if reader.read_u8()? != STATUS_PUSH {
        return Err(WireError::Malformed("not a push frame"));
    }

    let _request = reader.read_i32()?;
    let _payload = reader.read_bytes()?;

    Ok(reader.position())
}

/// Decodes the error status body: `(1 || class || message)*` terminated by a
/// zero byte, then the serialized exception blob.
fn decode_error_frame(reader: &mut Reader) -> WireResult<DriverError> {
    let mut pairs = Vec::new();

    loop {
        match reader.read_u8()? {
            0 => break,
            1 => {
                let class = reader.read_string()?.unwrap_or_default();
                let message = reader.read_string()?.unwrap_or_default();
                pairs.push((class, message));
            }
            _ => return Err(WireError::Malformed("bad error frame tag")),
        }
    }

    let _exception = reader.read_bytes()?;

    Ok(DriverError::Server(pairs))
}

/// Decodes the success payload for `op`. The outer result covers framing
/// (`Wait` / unrecoverable garbage); the inner result carries per-call
/// faults found inside length-delimited record content, for which the frame
/// boundary is still known.
fn decode_payload(
    op: Op,
    reader: &mut Reader,
    schema: Option<&Schema>,
) -> WireResult<Result<OpResponse, DriverError>> {
    let response = match op {
        Op::Shutdown | Op::DbCreate | Op::DbDrop | Op::DbClose => Ok(OpResponse::Unit),
        Op::DbExist => Ok(OpResponse::Exists(reader.read_bool()?)),
        Op::RecordDelete => Ok(OpResponse::Deleted(reader.read_bool()?)),
        Op::DbSize | Op::DbCountRecords => Ok(OpResponse::Count(reader.read_i64()?)),
        Op::DbReload => Ok(OpResponse::Clusters(decode_clusters(reader)?)),
        Op::Connect => Ok(OpResponse::Opened(SessionOpened {
            token: reader.read_bytes()?.map(<[u8]>::to_vec),
            clusters: Vec::new(),
            cluster_config: None,
            release: None,
        })),
        Op::DbOpen => Ok(OpResponse::Opened(SessionOpened {
            token: reader.read_bytes()?.map(<[u8]>::to_vec),
            clusters: decode_clusters(reader)?,
            cluster_config: reader.read_bytes()?.map(<[u8]>::to_vec),
            release: reader.read_string()?,
        })),
        Op::DbList => {
            let blob = match reader.read_bytes()? {
                Some(blob) => blob,
                None => return Err(WireError::Malformed("null database listing")),
            };

            match record::decode_record(blob, None) {
                Ok(document) => Ok(OpResponse::Databases(document)),
                Err(err) => Err(blob_fault(err)),
            }
        }
        Op::RecordLoad | Op::RecordLoadIfVersionNotLatest => {
            let mut records = Vec::new();
            let mut fault = None;

            loop {
                match reader.read_u8()? {
                    0 => break,
                    1 | 2 => {
                        let kind = reader.read_u8()?;
                        let version = reader.read_i32()?;
                        let blob = reader.read_bytes()?;

                        match decode_record_blob(kind, blob, schema) {
                            Ok(document) => records.push(FetchedRecord {
                                rid: None,
                                version,
                                document,
                            }),
                            Err(err) => fault = fault.or(Some(err)),
                        }
                    }
                    _ => return Err(WireError::Malformed("bad record payload status")),
                }
            }

            match fault {
                Some(err) => Err(err),
                None => Ok(OpResponse::Records(records)),
            }
        }
        Op::RecordCreate => {
            let rid = Rid::new(reader.read_i16()?, reader.read_i64()?);
            let version = reader.read_i32()?;
            skip_collection_changes(reader)?;
            Ok(OpResponse::Created { rid, version })
        }
        Op::RecordUpdate => {
            let version = reader.read_i32()?;
            skip_collection_changes(reader)?;
            Ok(OpResponse::Updated { version })
        }
        Op::Command => decode_command_payload(reader, schema)?,
        Op::TxCommit => {
            let mut created = Vec::new();
            for _ in 0..read_list_len(reader)? {
                let client = Rid::new(reader.read_i16()?, reader.read_i64()?);
                let assigned = Rid::new(reader.read_i16()?, reader.read_i64()?);
                created.push((client, assigned));
            }

            let mut updated = Vec::new();
            for _ in 0..read_list_len(reader)? {
                let rid = Rid::new(reader.read_i16()?, reader.read_i64()?);
                let version = reader.read_i32()?;
                updated.push((rid, version));
            }

            skip_collection_changes(reader)?;
            Ok(OpResponse::TxCommitted { created, updated })
        }
    };

    Ok(response)
}

fn decode_command_payload(
    reader: &mut Reader,
    schema: Option<&Schema>,
) -> WireResult<Result<OpResponse, DriverError>> {
    let result = match reader.read_u8()? {
        b'n' => Ok(CommandResult::None),
        b'a' => {
            let scalar = reader
                .read_string()?
                .ok_or(WireError::Malformed("null command scalar"))?;
            Ok(CommandResult::Scalar(scalar))
        }
        b'r' => match decode_command_record(reader, schema)? {
            Ok(Some(found)) => Ok(CommandResult::Record(found)),
            Ok(None) => Ok(CommandResult::None),
            Err(err) => Err(err),
        },
        b'l' => {
            let mut items = Vec::new();
            let mut fault = None;

            for _ in 0..read_list_len(reader)? {
                match decode_command_record(reader, schema)? {
                    Ok(Some(found)) => items.push(found),
                    Ok(None) => {}
                    Err(err) => fault = fault.or(Some(err)),
                }
            }

            match fault {
                Some(err) => Err(err),
                None => Ok(CommandResult::Collection(items)),
            }
        }
        _ => return Err(WireError::Malformed("unknown command result kind")),
    };

    Ok(result.map(OpResponse::Command))
}

/// Decodes the short-marker record form used in command responses:
/// `-2` null, `-3` RID reference, `0` full record.
fn decode_command_record(
    reader: &mut Reader,
    schema: Option<&Schema>,
) -> WireResult<Result<Option<FetchedRecord>, DriverError>> {
    match reader.read_i16()? {
        -2 => Ok(Ok(None)),
        -3 => {
            let rid = Rid::new(reader.read_i16()?, reader.read_i64()?);
            Ok(Ok(Some(FetchedRecord {
                rid: Some(rid),
                version: 0,
                document: Document::new(""),
            })))
        }
        0 => {
            let kind = reader.read_u8()?;
            let rid = Rid::new(reader.read_i16()?, reader.read_i64()?);
            let version = reader.read_i32()?;
            let blob = reader.read_bytes()?;

            match decode_record_blob(kind, blob, schema) {
                Ok(mut document) => {
                    document.rid = Some(rid);
                    document.version = version;
                    Ok(Ok(Some(FetchedRecord {
                        rid: Some(rid),
                        version,
                        document,
                    })))
                }
                Err(err) => Ok(Err(err)),
            }
        }
        _ => Err(WireError::Malformed("bad record marker")),
    }
}

/// Decodes a complete record content blob. All failures inside the blob are
/// per-call: the enclosing frame boundary is already known.
fn decode_record_blob(
    kind: u8,
    blob: Option<&[u8]>,
    schema: Option<&Schema>,
) -> Result<Document, DriverError> {
    if kind != RECORD_KIND_DOCUMENT {
        return Err(DriverError::MalformedResponse("unsupported record kind"));
    }

    let blob = blob.ok_or(DriverError::MalformedResponse("null record content"))?;

    record::decode_record(blob, schema).map_err(blob_fault)
}

fn blob_fault(err: WireError) -> DriverError {
    match err {
        // The blob is complete by construction, so an inner `Wait` means the
        // content itself is truncated.
        WireError::Wait => DriverError::MalformedResponse("truncated record content"),
        other => other.into(),
    }
}

fn decode_clusters(reader: &mut Reader) -> WireResult<Vec<Cluster>> {
    let count = reader.read_i16()?;

    if count < 0 {
        return Err(WireError::Malformed("negative cluster count"));
    }

    let mut clusters = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let name = reader
            .read_string()?
            .ok_or(WireError::Malformed("null cluster name"))?;
        let id = reader.read_i16()?;
        clusters.push(Cluster { name, id });
    }

    Ok(clusters)
}

fn read_list_len(reader: &mut Reader) -> WireResult<usize> {
    let count = reader.read_i32()?;

    if count < 0 {
        return Err(WireError::Malformed("negative list length"));
    }

    Ok(count as usize)
}

/// Skips the collection-change notifications appended to write responses:
/// `count (i32)` entries of two uuid longs, file id, page index and offset.
fn skip_collection_changes(reader: &mut Reader) -> WireResult<()> {
    for _ in 0..read_list_len(reader)? {
        reader.read_i64()?;
        reader.read_i64()?;
        reader.read_i64()?;
        reader.read_i64()?;
        reader.read_i32()?;
    }

    Ok(())
}

/// A synchronous SQL query (`OSQLSynchQuery`, class tag `"q"`).
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub text: String,
    pub limit: i32,
    pub fetch_plan: String,
    pub params: Option<Vec<u8>>,
}

impl Query {
    pub fn new<S: Into<String>>(text: S) -> Query {
        Query {
            text: text.into(),
            limit: -1,
            fetch_plan: String::new(),
            params: None,
        }
    }

    /// Argument stream for a synchronous `command` call.
    pub fn args(&self) -> Vec<Arg> {
        let mut payload = Vec::new();
        wire::put_string(&mut payload, "q");
        wire::put_string(&mut payload, &self.text);
        wire::put_i32(&mut payload, self.limit);
        wire::put_string(&mut payload, &self.fetch_plan);
        wire::put_opt_bytes(&mut payload, self.params.as_deref());

        vec![Arg::Raw(vec![b's']), Arg::Bytes(payload)]
    }
}

/// A non-idempotent SQL command (`OCommandSQL`, class tag `"c"`).
#[derive(Debug, Clone, PartialEq)]
pub struct SqlCommand {
    pub text: String,
    pub params: Option<Vec<u8>>,
}

impl SqlCommand {
    pub fn new<S: Into<String>>(text: S) -> SqlCommand {
        SqlCommand {
            text: text.into(),
            params: None,
        }
    }

    /// Argument stream for a synchronous `command` call.
    pub fn args(&self) -> Vec<Arg> {
        let mut payload = Vec::new();
        wire::put_string(&mut payload, "c");
        wire::put_string(&mut payload, &self.text);
        wire::put_opt_bytes(&mut payload, self.params.as_deref());

        vec![Arg::Raw(vec![b's']), Arg::Bytes(payload)]
    }
}

/// One record operation inside a transaction commit.
#[derive(Debug, Clone, PartialEq)]
pub enum TxOperation {
    Create { record: Document },
    Update { rid: Rid, version: i32, record: Document },
    Delete { rid: Rid, version: i32 },
}

/// Builds the `tx_commit` argument stream. The leading
/// [`Arg::TransactionId`] placeholder is replaced by the session with a
/// freshly allocated id; created records without a rid get client-side
/// temporary positions on cluster `-1`.
pub fn tx_commit_args(operations: &[TxOperation], using_log: bool) -> Vec<Arg> {
    let mut entries = Vec::new();
    let mut temp_position = -2i64;

    for operation in operations {
        wire::put_u8(&mut entries, 1);

        match operation {
            TxOperation::Create { record } => {
                wire::put_u8(&mut entries, TX_CREATE);

                let rid = record.rid.unwrap_or_else(|| Rid::new(-1, temp_position));
                if record.rid.is_none() {
                    temp_position -= 1;
                }

                wire::put_i16(&mut entries, rid.cluster);
                wire::put_i64(&mut entries, rid.position);
                wire::put_u8(&mut entries, RECORD_KIND_DOCUMENT);
                wire::put_bytes(&mut entries, &record::encode_record(record));
            }
            TxOperation::Update {
                rid,
                version,
                record,
            } => {
                wire::put_u8(&mut entries, TX_UPDATE);
                wire::put_i16(&mut entries, rid.cluster);
                wire::put_i64(&mut entries, rid.position);
                wire::put_u8(&mut entries, RECORD_KIND_DOCUMENT);
                wire::put_i32(&mut entries, *version);
                wire::put_bytes(&mut entries, &record::encode_record(record));
                wire::put_bool(&mut entries, true); // update content
            }
            TxOperation::Delete { rid, version } => {
                wire::put_u8(&mut entries, TX_DELETE);
                wire::put_i16(&mut entries, rid.cluster);
                wire::put_i64(&mut entries, rid.position);
                wire::put_u8(&mut entries, RECORD_KIND_DOCUMENT);
                wire::put_i32(&mut entries, *version);
            }
        }
    }

    wire::put_u8(&mut entries, 0);
    wire::put_string(&mut entries, ""); // index changes

    vec![Arg::TransactionId, Arg::Bool(using_log), Arg::Raw(entries)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use rand::Rng;

    fn ok_frame(session_id: i32) -> Vec<u8> {
        let mut frame = vec![STATUS_OK];
        wire::put_i32(&mut frame, session_id);
        frame
    }

    #[test]
    fn test_encode_db_size_request() {
        let mut frame = Vec::new();
        encode_request(Op::DbSize, 42, &[], &mut frame);

        assert_eq!(frame, [0x08, 0x00, 0x00, 0x00, 0x2a]);
    }

    #[test]
    fn test_encode_connect_request() {
        let mut frame = Vec::new();
        encode_request(Op::Connect, -1, &connect_args("root", "root"), &mut frame);

        let mut expected = vec![0x02, 0xff, 0xff, 0xff, 0xff];
        wire::put_string(&mut expected, crate::DRIVER_NAME);
        wire::put_string(&mut expected, crate::DRIVER_VERSION);
        wire::put_i16(&mut expected, 0x1c);
        wire::put_string(&mut expected, "");
        wire::put_string(&mut expected, "ORecordSerializerBinary");
        wire::put_bool(&mut expected, false);
        wire::put_string(&mut expected, "root");
        wire::put_string(&mut expected, "root");

        assert_eq!(frame, expected);
    }

    #[test]
    fn test_encode_record_load_request() {
        let args = [
            Arg::Rid(Rid::new(9, 0)),
            Arg::Str("*:-1".to_string()),
            Arg::Bool(true),
            Arg::Bool(false),
        ];

        let mut frame = Vec::new();
        encode_request(Op::RecordLoad, 7, &args, &mut frame);

        let mut expected = vec![30];
        wire::put_i32(&mut expected, 7);
        wire::put_i16(&mut expected, 9);
        wire::put_i64(&mut expected, 0);
        wire::put_string(&mut expected, "*:-1");
        expected.extend_from_slice(&[1, 0]);

        assert_eq!(frame, expected);
    }

    #[test]
    fn test_decode_db_size_response() {
        // Literal frame: status ok, session 42, long 1_048_576.
        let frame = [
            0x00, 0x00, 0x00, 0x00, 0x2a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00,
        ];

        let (response, consumed) = decode_response(Op::DbSize, &frame, None).unwrap();

        assert_eq!(consumed, 13);
        assert_eq!(response.session_id, 42);
        assert_eq!(response.body, Ok(OpResponse::Count(1_048_576)));
    }

    #[test]
    fn test_decode_connect_response() {
        // Status ok, new session id 42, null token.
        let frame = [0x00, 0x00, 0x00, 0x00, 0x2a, 0xff, 0xff, 0xff, 0xff];

        let (response, consumed) = decode_response(Op::Connect, &frame, None).unwrap();

        assert_eq!(consumed, frame.len());
        assert_eq!(response.session_id, 42);
        assert_eq!(
            response.body,
            Ok(OpResponse::Opened(SessionOpened {
                token: None,
                clusters: Vec::new(),
                cluster_config: None,
                release: None,
            }))
        );
    }

    #[test]
    fn test_decode_db_open_response() {
        let mut frame = ok_frame(9);
        wire::put_opt_bytes(&mut frame, None); // token
        wire::put_i16(&mut frame, 2);
        wire::put_string(&mut frame, "internal");
        wire::put_i16(&mut frame, 0);
        wire::put_string(&mut frame, "person");
        wire::put_i16(&mut frame, 11);
        wire::put_opt_bytes(&mut frame, None); // cluster config
        wire::put_string(&mut frame, "2.1.0");

        let (response, consumed) = decode_response(Op::DbOpen, &frame, None).unwrap();

        assert_eq!(consumed, frame.len());
        match response.body.unwrap() {
            OpResponse::Opened(opened) => {
                assert_eq!(opened.clusters.len(), 2);
                assert_eq!(opened.clusters[1].name, "person");
                assert_eq!(opened.clusters[1].id, 11);
                assert_eq!(opened.release.as_deref(), Some("2.1.0"));
            }
            other => panic!("Unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_decode_error_response() {
        let mut frame = vec![STATUS_ERROR];
        wire::put_i32(&mut frame, 42);
        wire::put_u8(&mut frame, 1);
        wire::put_string(&mut frame, "com.orientechnologies.OException");
        wire::put_string(&mut frame, "boom");
        wire::put_u8(&mut frame, 0);
        wire::put_opt_bytes(&mut frame, None); // exception blob

        let (response, consumed) = decode_response(Op::DbSize, &frame, None).unwrap();

        assert_eq!(consumed, frame.len());
        assert_eq!(
            response.body,
            Err(DriverError::Server(vec![(
                "com.orientechnologies.OException".to_string(),
                "boom".to_string()
            )]))
        );
    }

    fn record_load_frame(session_id: i32, blobs: &[&[u8]]) -> Vec<u8> {
        let mut frame = ok_frame(session_id);

        for (index, blob) in blobs.iter().enumerate() {
            wire::put_u8(&mut frame, if index == 0 { 1 } else { 2 });
            wire::put_u8(&mut frame, RECORD_KIND_DOCUMENT);
            wire::put_i32(&mut frame, 1 + index as i32);
            wire::put_bytes(&mut frame, blob);
        }

        wire::put_u8(&mut frame, 0);
        frame
    }

    #[test]
    fn test_decode_record_load_response() {
        let document = Document::new("Schemaless").with("name", Value::String("x".into()));
        let blob = record::encode_record(&document);
        let frame = record_load_frame(42, &[&blob]);

        let (response, consumed) = decode_response(Op::RecordLoad, &frame, None).unwrap();

        assert_eq!(consumed, frame.len());
        match response.body.unwrap() {
            OpResponse::Records(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].version, 1);
                assert_eq!(records[0].document, document);
            }
            other => panic!("Unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_record_load_unknown_property_is_per_call() {
        // A frame referencing global property 7 against an empty schema.
        let mut blob = vec![record::SERIALIZER_VERSION];
        wire::put_varint_string(&mut blob, "Person");
        wire::put_varint(&mut blob, -8);
        wire::put_i32(&mut blob, 0);
        wire::put_u8(&mut blob, 7);
        wire::put_varint(&mut blob, 0);

        let frame = record_load_frame(42, &[&blob]);
        let schema = Schema::new();

        let (response, consumed) = decode_response(Op::RecordLoad, &frame, Some(&schema)).unwrap();

        // The frame is fully consumed even though the caller sees the fault.
        assert_eq!(consumed, frame.len());
        assert_eq!(response.body, Err(DriverError::UnknownPropertyId(7)));
    }

    #[test]
    fn test_streaming_decode_waits_on_every_prefix() {
        let document = Document::new("Chunky")
            .with("n", Value::I32(5))
            .with("s", Value::String("stream".into()));
        let frame = record_load_frame(3, &[&record::encode_record(&document)]);

        for split in 0..frame.len() {
            assert_eq!(
                decode_response(Op::RecordLoad, &frame[..split], None),
                Err(WireError::Wait),
                "prefix of {} bytes should be incomplete",
                split
            );
        }

        assert!(decode_response(Op::RecordLoad, &frame, None).is_ok());
    }

    #[test]
    fn test_streaming_decode_is_chunking_independent() {
        let document = Document::new("Chunky").with("payload", Value::Bytes(vec![7; 64]));
        let frame = record_load_frame(3, &[&record::encode_record(&document)]);
        let (whole, _) = decode_response(Op::RecordLoad, &frame, None).unwrap();

        let mut rng = rand::thread_rng();

        for _ in 0..32 {
            let mut buffered = Vec::new();
            let mut cursor = 0;
            let mut decoded = None;

            while cursor < frame.len() {
                let chunk = rng.gen_range(1..=frame.len() - cursor);
                buffered.extend_from_slice(&frame[cursor..cursor + chunk]);
                cursor += chunk;

                match decode_response(Op::RecordLoad, &buffered, None) {
                    Err(WireError::Wait) => assert!(cursor < frame.len()),
                    Ok((response, consumed)) => {
                        assert_eq!(consumed, buffered.len());
                        decoded = Some(response);
                    }
                    Err(err) => panic!("Unexpected decode error {:?}", err),
                }
            }

            assert_eq!(decoded.unwrap(), whole);
        }
    }

    #[test]
    fn test_decode_record_create_response() {
        let mut frame = ok_frame(42);
        wire::put_i16(&mut frame, 9);
        wire::put_i64(&mut frame, 12);
        wire::put_i32(&mut frame, 1);
        wire::put_i32(&mut frame, 1); // one collection change, skipped
        wire::put_i64(&mut frame, 1);
        wire::put_i64(&mut frame, 2);
        wire::put_i64(&mut frame, 3);
        wire::put_i64(&mut frame, 4);
        wire::put_i32(&mut frame, 5);

        let (response, consumed) = decode_response(Op::RecordCreate, &frame, None).unwrap();

        assert_eq!(consumed, frame.len());
        assert_eq!(
            response.body,
            Ok(OpResponse::Created {
                rid: Rid::new(9, 12),
                version: 1
            })
        );
    }

    #[test]
    fn test_decode_command_variants() {
        // Null result.
        let mut frame = ok_frame(1);
        wire::put_u8(&mut frame, b'n');
        let (response, _) = decode_response(Op::Command, &frame, None).unwrap();
        assert_eq!(response.body, Ok(OpResponse::Command(CommandResult::None)));

        // Scalar result.
        let mut frame = ok_frame(1);
        wire::put_u8(&mut frame, b'a');
        wire::put_string(&mut frame, "3");
        let (response, _) = decode_response(Op::Command, &frame, None).unwrap();
        assert_eq!(
            response.body,
            Ok(OpResponse::Command(CommandResult::Scalar("3".to_string())))
        );

        // Collection with one full record and one reference.
        let document = Document::new("Person").with("name", Value::String("x".into()));
        let blob = record::encode_record(&document);

        let mut frame = ok_frame(1);
        wire::put_u8(&mut frame, b'l');
        wire::put_i32(&mut frame, 2);
        wire::put_i16(&mut frame, 0);
        wire::put_u8(&mut frame, RECORD_KIND_DOCUMENT);
        wire::put_i16(&mut frame, 9);
        wire::put_i64(&mut frame, 0);
        wire::put_i32(&mut frame, 3);
        wire::put_bytes(&mut frame, &blob);
        wire::put_i16(&mut frame, -3);
        wire::put_i16(&mut frame, 9);
        wire::put_i64(&mut frame, 1);

        let (response, consumed) = decode_response(Op::Command, &frame, None).unwrap();
        assert_eq!(consumed, frame.len());

        match response.body.unwrap() {
            OpResponse::Command(CommandResult::Collection(items)) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].rid, Some(Rid::new(9, 0)));
                assert_eq!(items[0].version, 3);
                assert_eq!(items[0].document.get("name"), Some(&Value::String("x".into())));
                assert_eq!(items[1].rid, Some(Rid::new(9, 1)));
            }
            other => panic!("Unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_decode_tx_commit_response() {
        let mut frame = ok_frame(42);
        wire::put_i32(&mut frame, 1); // created
        wire::put_i16(&mut frame, -1);
        wire::put_i64(&mut frame, -2);
        wire::put_i16(&mut frame, 9);
        wire::put_i64(&mut frame, 7);
        wire::put_i32(&mut frame, 1); // updated
        wire::put_i16(&mut frame, 9);
        wire::put_i64(&mut frame, 3);
        wire::put_i32(&mut frame, 12);
        wire::put_i32(&mut frame, 0); // collection changes

        let (response, consumed) = decode_response(Op::TxCommit, &frame, None).unwrap();

        assert_eq!(consumed, frame.len());
        assert_eq!(
            response.body,
            Ok(OpResponse::TxCommitted {
                created: vec![(Rid::new(-1, -2), Rid::new(9, 7))],
                updated: vec![(Rid::new(9, 3), 12)],
            })
        );
    }

    #[test]
    fn test_decode_push_frame() {
        let mut frame = vec![STATUS_PUSH];
        wire::put_i32(&mut frame, -10);
        wire::put_bytes(&mut frame, &[1, 2, 3]);

        assert_eq!(decode_push(&frame).unwrap(), frame.len());
        assert_eq!(decode_push(&frame[..4]), Err(WireError::Wait));
    }

    #[test]
    fn test_unknown_status_is_malformed() {
        let frame = [7u8, 0, 0, 0, 0];
        assert_eq!(
            decode_response(Op::DbSize, &frame, None),
            Err(WireError::Malformed("unknown response status"))
        );
    }

    #[test]
    fn test_query_args_layout() {
        let query = Query::new("SELECT FROM Person");
        let args = query.args();

        assert_eq!(args[0], Arg::Raw(vec![b's']));

        let mut expected = Vec::new();
        wire::put_string(&mut expected, "q");
        wire::put_string(&mut expected, "SELECT FROM Person");
        wire::put_i32(&mut expected, -1);
        wire::put_string(&mut expected, "");
        wire::put_i32(&mut expected, -1);

        assert_eq!(args[1], Arg::Bytes(expected));
    }

    #[test]
    fn test_tx_commit_args_layout() {
        let record = Document::new("Person").with("name", Value::String("x".into()));
        let operations = [
            TxOperation::Create {
                record: record.clone(),
            },
            TxOperation::Delete {
                rid: Rid::new(9, 4),
                version: 2,
            },
        ];

        let args = tx_commit_args(&operations, true);

        assert_eq!(args[0], Arg::TransactionId);
        assert_eq!(args[1], Arg::Bool(true));

        let mut expected = Vec::new();
        wire::put_u8(&mut expected, 1);
        wire::put_u8(&mut expected, TX_CREATE);
        wire::put_i16(&mut expected, -1);
        wire::put_i64(&mut expected, -2);
        wire::put_u8(&mut expected, RECORD_KIND_DOCUMENT);
        wire::put_bytes(&mut expected, &record::encode_record(&record));
        wire::put_u8(&mut expected, 1);
        wire::put_u8(&mut expected, TX_DELETE);
        wire::put_i16(&mut expected, 9);
        wire::put_i64(&mut expected, 4);
        wire::put_u8(&mut expected, RECORD_KIND_DOCUMENT);
        wire::put_i32(&mut expected, 2);
        wire::put_u8(&mut expected, 0);
        wire::put_string(&mut expected, "");

        assert_eq!(args[2], Arg::Raw(expected));
    }

    #[test]
    fn test_scope_partition() {
        assert_eq!(Op::Shutdown.scope(), Some(Scope::Server));
        assert_eq!(Op::DbList.scope(), Some(Scope::Server));
        assert_eq!(Op::DbSize.scope(), Some(Scope::Database));
        assert_eq!(Op::TxCommit.scope(), Some(Scope::Database));
        assert_eq!(Op::Connect.scope(), None);
        assert_eq!(Op::DbOpen.scope(), None);
    }
}
