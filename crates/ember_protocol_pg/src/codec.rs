use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use ember_common::error::ProtocolError;

const SSL_REQUEST_CODE: i32 = 80877103;
const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Raw parameter value: `None` is SQL NULL.
pub type RawValue = Option<Vec<u8>>;

/// PG frontend (client→server) messages.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage {
    /// Initial startup message (no type byte).
    Startup {
        version: i32,
        params: HashMap<String, String>,
    },
    SslRequest,
    /// Sent on a fresh connection to interrupt another session.
    CancelRequest { process_id: i32, secret_key: i32 },
    /// Simple query ('Q').
    Query(String),
    /// Parse ('P').
    Parse {
        name: String,
        query: String,
        param_types: Vec<i32>,
    },
    /// Bind ('B').
    Bind(BindMessage),
    /// Describe ('D'). `kind` is `S` or `P`; validated by the session.
    Describe { kind: u8, name: String },
    /// Execute ('E').
    Execute { portal: String, max_rows: i32 },
    /// Close ('C').
    Close { kind: u8, name: String },
    /// Flush ('H').
    Flush,
    /// Sync ('S').
    Sync,
    /// Terminate ('X').
    Terminate,
    /// Batch bind-execute ('U').
    BatchBindExecute(BatchBindMessage),
    /// A well-framed message whose body could not be decoded. The frame has
    /// been consumed, so the stream is still in sync.
    Invalid { tag: u8, reason: String },
}

impl FrontendMessage {
    /// Wire tag of this message.
    pub fn tag(&self) -> u8 {
        match self {
            FrontendMessage::Startup { .. }
            | FrontendMessage::SslRequest
            | FrontendMessage::CancelRequest { .. } => 0,
            FrontendMessage::Query(_) => b'Q',
            FrontendMessage::Parse { .. } => b'P',
            FrontendMessage::Bind(_) => b'B',
            FrontendMessage::Describe { .. } => b'D',
            FrontendMessage::Execute { .. } => b'E',
            FrontendMessage::Close { .. } => b'C',
            FrontendMessage::Flush => b'H',
            FrontendMessage::Sync => b'S',
            FrontendMessage::Terminate => b'X',
            FrontendMessage::BatchBindExecute(_) => b'U',
            FrontendMessage::Invalid { tag, .. } => *tag,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub param_formats: Vec<i16>,
    pub param_values: Vec<RawValue>,
    pub result_formats: Vec<i16>,
}

/// One Bind applied to many parameter sets, followed by one Describe and
/// one Execute.
///
/// Body layout:
/// ```text
/// Int32  batch count (K)
/// String portal name
/// String statement name
/// Int16  parameter format count, Int16[] formats
/// Int16  parameters per set (N)
/// K × N × (Int32 length, -1 for NULL; Byte[length])
/// Int16  result format count, Int16[] formats
/// Byte   describe kind ('S', 'P', or 0 for none), String describe target
/// String execute portal, Int32 max rows
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchBindMessage {
    pub portal: String,
    pub statement: String,
    pub param_formats: Vec<i16>,
    pub param_sets: Vec<Vec<RawValue>>,
    pub result_formats: Vec<i16>,
    pub describe: Option<(u8, String)>,
    pub execute_portal: String,
    pub max_rows: i32,
}

/// PG backend (server→client) messages.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    AuthenticationOk,
    /// Parameter status ('S').
    ParameterStatus { name: String, value: String },
    /// Backend key data ('K').
    BackendKeyData { process_id: i32, secret_key: i32 },
    /// Ready for query ('Z').
    ReadyForQuery { txn_status: u8 },
    /// Row description ('T').
    RowDescription { fields: Vec<FieldDescription> },
    /// Data row ('D'). Values are already encoded in the column's format.
    DataRow { values: Vec<RawValue> },
    /// Command complete ('C').
    CommandComplete { tag: String },
    /// Error response ('E').
    ErrorResponse {
        severity: String,
        code: String,
        message: String,
    },
    /// Notice response ('N').
    NoticeResponse {
        severity: String,
        code: String,
        message: String,
    },
    /// Empty query response ('I').
    EmptyQueryResponse,
    /// Parse complete ('1').
    ParseComplete,
    /// Bind complete ('2').
    BindComplete,
    /// Close complete ('3').
    CloseComplete,
    /// No data ('n').
    NoData,
    /// Parameter description ('t').
    ParameterDescription { type_oids: Vec<i32> },
    /// Portal suspended ('s').
    PortalSuspended,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: i32,
    pub type_len: i16,
    pub type_modifier: i32,
    pub format_code: i16, // 0 = text, 1 = binary
}

/// Decode a startup-phase message (no type byte).
/// Returns `Ok(None)` if more data is needed.
pub fn decode_startup(
    buf: &mut BytesMut,
    max_len: usize,
) -> Result<Option<FrontendMessage>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = frame_len((&buf[0..4]).get_i32(), max_len)?;
    if buf.len() < len {
        return Ok(None);
    }

    let mut body = buf.split_to(len);
    body.advance(4);
    if body.remaining() < 4 {
        return Err(ProtocolError::Malformed("startup packet too short".into()));
    }
    let version = body.get_i32();

    if version == SSL_REQUEST_CODE {
        return Ok(Some(FrontendMessage::SslRequest));
    }
    if version == CANCEL_REQUEST_CODE {
        if body.remaining() < 8 {
            return Err(ProtocolError::Malformed("cancel request too short".into()));
        }
        let process_id = body.get_i32();
        let secret_key = body.get_i32();
        return Ok(Some(FrontendMessage::CancelRequest {
            process_id,
            secret_key,
        }));
    }

    let mut params = HashMap::new();
    while body.has_remaining() {
        let key = read_cstring(&mut body).map_err(ProtocolError::Malformed)?;
        if key.is_empty() {
            break;
        }
        let value = read_cstring(&mut body).map_err(ProtocolError::Malformed)?;
        params.insert(key, value);
    }
    Ok(Some(FrontendMessage::Startup { version, params }))
}

/// Decode one regular frontend message.
///
/// Returns `Ok(None)` if more data is needed. Framing problems (bad length,
/// unknown type byte) are connection-fatal errors; a bad body inside a good
/// frame yields [`FrontendMessage::Invalid`].
pub fn decode_message(
    buf: &mut BytesMut,
    max_len: usize,
) -> Result<Option<FrontendMessage>, ProtocolError> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let tag = buf[0];
    if !is_known_tag(tag) {
        return Err(ProtocolError::UnknownMessageType(tag));
    }
    let len = frame_len((&buf[1..5]).get_i32(), max_len)?;
    if buf.len() < 1 + len {
        return Ok(None);
    }

    buf.advance(1);
    let mut body = buf.split_to(len);
    body.advance(4);

    let decoded = decode_body(tag, &mut body).and_then(|msg| {
        if body.has_remaining() {
            Err(format!("{} trailing bytes", body.remaining()))
        } else {
            Ok(msg)
        }
    });
    Ok(Some(decoded.unwrap_or_else(|reason| {
        tracing::debug!(tag = %char::from(tag), %reason, "invalid frontend message body");
        FrontendMessage::Invalid { tag, reason }
    })))
}

fn is_known_tag(tag: u8) -> bool {
    matches!(
        tag,
        b'Q' | b'P' | b'B' | b'D' | b'E' | b'C' | b'H' | b'S' | b'X' | b'U'
    )
}

fn frame_len(raw: i32, max_len: usize) -> Result<usize, ProtocolError> {
    let len = usize::try_from(raw)
        .ok()
        .filter(|l| *l >= 4)
        .ok_or_else(|| ProtocolError::Malformed(format!("invalid message length {raw}")))?;
    if len > max_len {
        return Err(ProtocolError::MessageTooLarge { len, max: max_len });
    }
    Ok(len)
}

fn decode_body(tag: u8, body: &mut BytesMut) -> Result<FrontendMessage, String> {
    match tag {
        b'Q' => Ok(FrontendMessage::Query(read_cstring(body)?)),
        b'P' => {
            let name = read_cstring(body)?;
            let query = read_cstring(body)?;
            let n = read_count(body)?;
            let mut param_types = Vec::with_capacity(n);
            for _ in 0..n {
                param_types.push(read_i32(body)?);
            }
            Ok(FrontendMessage::Parse {
                name,
                query,
                param_types,
            })
        }
        b'B' => {
            let portal = read_cstring(body)?;
            let statement = read_cstring(body)?;
            let param_formats = read_i16_list(body)?;
            let n = read_count(body)?;
            let param_values = read_values(body, n)?;
            let result_formats = read_i16_list(body)?;
            Ok(FrontendMessage::Bind(BindMessage {
                portal,
                statement,
                param_formats,
                param_values,
                result_formats,
            }))
        }
        b'D' => {
            let kind = read_u8(body)?;
            let name = read_cstring(body)?;
            Ok(FrontendMessage::Describe { kind, name })
        }
        b'E' => {
            let portal = read_cstring(body)?;
            let max_rows = read_i32(body)?;
            Ok(FrontendMessage::Execute { portal, max_rows })
        }
        b'C' => {
            let kind = read_u8(body)?;
            let name = read_cstring(body)?;
            Ok(FrontendMessage::Close { kind, name })
        }
        b'H' => Ok(FrontendMessage::Flush),
        b'S' => Ok(FrontendMessage::Sync),
        b'X' => Ok(FrontendMessage::Terminate),
        b'U' => decode_batch(body).map(FrontendMessage::BatchBindExecute),
        other => Err(format!("unexpected message type {}", char::from(other))),
    }
}

fn decode_batch(body: &mut BytesMut) -> Result<BatchBindMessage, String> {
    let batch_count = read_i32(body)?;
    let batch_count =
        usize::try_from(batch_count).map_err(|_| format!("invalid batch count {batch_count}"))?;
    let portal = read_cstring(body)?;
    let statement = read_cstring(body)?;
    let param_formats = read_i16_list(body)?;
    let per_set = read_count(body)?;
    let mut param_sets = Vec::with_capacity(batch_count.min(4096));
    for _ in 0..batch_count {
        param_sets.push(read_values(body, per_set)?);
    }
    let result_formats = read_i16_list(body)?;
    let describe_kind = read_u8(body)?;
    let describe_name = read_cstring(body)?;
    let describe = (describe_kind != 0).then_some((describe_kind, describe_name));
    let execute_portal = read_cstring(body)?;
    let max_rows = read_i32(body)?;
    Ok(BatchBindMessage {
        portal,
        statement,
        param_formats,
        param_sets,
        result_formats,
        describe,
        execute_portal,
        max_rows,
    })
}

/// Encode a backend message into bytes.
pub fn encode_message(msg: &BackendMessage) -> BytesMut {
    let mut buf = BytesMut::new();
    encode_into(&mut buf, msg);
    buf
}

/// Append the wire form of `msg` to `buf`.
pub fn encode_into(buf: &mut BytesMut, msg: &BackendMessage) {
    let mut body = BytesMut::new();
    let tag = match msg {
        BackendMessage::AuthenticationOk => {
            body.put_i32(0);
            b'R'
        }
        BackendMessage::ParameterStatus { name, value } => {
            write_cstring(&mut body, name);
            write_cstring(&mut body, value);
            b'S'
        }
        BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        } => {
            body.put_i32(*process_id);
            body.put_i32(*secret_key);
            b'K'
        }
        BackendMessage::ReadyForQuery { txn_status } => {
            body.put_u8(*txn_status);
            b'Z'
        }
        BackendMessage::RowDescription { fields } => {
            body.put_i16(fields.len() as i16);
            for field in fields {
                write_cstring(&mut body, &field.name);
                body.put_i32(field.table_oid);
                body.put_i16(field.column_attr);
                body.put_i32(field.type_oid);
                body.put_i16(field.type_len);
                body.put_i32(field.type_modifier);
                body.put_i16(field.format_code);
            }
            b'T'
        }
        BackendMessage::DataRow { values } => {
            body.put_i16(values.len() as i16);
            for val in values {
                match val {
                    Some(bytes) => {
                        body.put_i32(bytes.len() as i32);
                        body.put_slice(bytes);
                    }
                    None => body.put_i32(-1),
                }
            }
            b'D'
        }
        BackendMessage::CommandComplete { tag } => {
            write_cstring(&mut body, tag);
            b'C'
        }
        BackendMessage::ErrorResponse {
            severity,
            code,
            message,
        } => {
            write_fields(&mut body, severity, code, message);
            b'E'
        }
        BackendMessage::NoticeResponse {
            severity,
            code,
            message,
        } => {
            write_fields(&mut body, severity, code, message);
            b'N'
        }
        BackendMessage::EmptyQueryResponse => b'I',
        BackendMessage::ParseComplete => b'1',
        BackendMessage::BindComplete => b'2',
        BackendMessage::CloseComplete => b'3',
        BackendMessage::NoData => b'n',
        BackendMessage::ParameterDescription { type_oids } => {
            body.put_i16(type_oids.len() as i16);
            for oid in type_oids {
                body.put_i32(*oid);
            }
            b't'
        }
        BackendMessage::PortalSuspended => b's',
    };
    buf.put_u8(tag);
    buf.put_i32(4 + body.len() as i32);
    buf.extend_from_slice(&body);
}

fn write_fields(body: &mut BytesMut, severity: &str, code: &str, message: &str) {
    body.put_u8(b'S');
    write_cstring(body, severity);
    body.put_u8(b'V');
    write_cstring(body, severity);
    body.put_u8(b'C');
    write_cstring(body, code);
    body.put_u8(b'M');
    write_cstring(body, message);
    body.put_u8(0);
}

fn read_cstring(buf: &mut BytesMut) -> Result<String, String> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| "missing string terminator".to_string())?;
    let s = String::from_utf8(buf[..pos].to_vec())
        .map_err(|e| format!("invalid UTF-8 in string: {e}"))?;
    buf.advance(pos + 1);
    Ok(s)
}

fn read_u8(buf: &mut BytesMut) -> Result<u8, String> {
    if buf.remaining() < 1 {
        return Err("insufficient data left in message".into());
    }
    Ok(buf.get_u8())
}

fn read_i16(buf: &mut BytesMut) -> Result<i16, String> {
    if buf.remaining() < 2 {
        return Err("insufficient data left in message".into());
    }
    Ok(buf.get_i16())
}

fn read_i32(buf: &mut BytesMut) -> Result<i32, String> {
    if buf.remaining() < 4 {
        return Err("insufficient data left in message".into());
    }
    Ok(buf.get_i32())
}

fn read_count(buf: &mut BytesMut) -> Result<usize, String> {
    let n = read_i16(buf)?;
    usize::try_from(n).map_err(|_| format!("invalid count {n}"))
}

fn read_i16_list(buf: &mut BytesMut) -> Result<Vec<i16>, String> {
    let n = read_count(buf)?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(read_i16(buf)?);
    }
    Ok(out)
}

fn read_values(buf: &mut BytesMut, n: usize) -> Result<Vec<RawValue>, String> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let len = read_i32(buf)?;
        if len == -1 {
            out.push(None);
            continue;
        }
        let len = usize::try_from(len).map_err(|_| format!("invalid value length {len}"))?;
        if buf.remaining() < len {
            return Err("insufficient data left in message".into());
        }
        out.push(Some(buf.split_to(len).to_vec()));
    }
    Ok(out)
}

fn write_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}
