//! # FastCGI Transport
//!
//! Responder-role FastCGI over a `may` TCP listener. Each connection runs on
//! its own coroutine and feeds complete requests through the same
//! [`RequestDispatcher`] the HTTP transport uses.
//!
//! ## Record layout
//!
//! ```text
//! version:u8 | type:u8 | request_id:u16 | content_len:u16 | padding_len:u8 | reserved:u8
//! content[content_len] padding[padding_len]
//! ```
//!
//! ## Supported exchange
//!
//! - `BEGIN_REQUEST` with the responder role; any other role is answered with
//!   `END_REQUEST(UNKNOWN_ROLE)`
//! - `PARAMS` then `STDIN`, each terminated by an empty record
//! - `ABORT_REQUEST` drops the pending request
//! - `GET_VALUES` answers `FCGI_MAX_CONNS`, `FCGI_MAX_REQS`, `FCGI_MPXS_CONNS`
//! - unknown management records get `UNKNOWN_TYPE`
//! - a second `BEGIN_REQUEST` while one is pending gets `END_REQUEST(CANT_MPX_CONN)`
//!
//! The response is a CGI header block plus body on `STDOUT`, an empty
//! `STDOUT`, then `END_REQUEST`. The connection closes afterwards unless the
//! web server set `FCGI_KEEP_CONN`.

use super::http_server::resolve;
use super::request::Request;
use super::request_job::RequestDispatcher;
use super::response::Response;
use crate::runtime_config::spawn_coroutine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use may::coroutine::JoinHandle;
use may::net::TcpListener;
use std::collections::HashMap;
use std::io::{self, BufReader, Read, Write};
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

pub const FCGI_VERSION_1: u8 = 1;
pub const HEADER_LEN: usize = 8;
pub const MAX_CONTENT_LEN: usize = 65535;
/// Largest PARAMS stream accepted for one request
pub const MAX_PARAMS_LEN: usize = 1024 * 1024;
/// Largest STDIN body accepted for one request
pub const MAX_STDIN_LEN: usize = 16 * 1024 * 1024;

pub const ROLE_RESPONDER: u16 = 1;
pub const FLAG_KEEP_CONN: u8 = 1;

pub const REQUEST_COMPLETE: u8 = 0;
pub const CANT_MPX_CONN: u8 = 1;
pub const OVERLOADED: u8 = 2;
pub const UNKNOWN_ROLE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
    GetValues,
    GetValuesResult,
    UnknownType,
    Other(u8),
}

impl From<u8> for RecordType {
    fn from(code: u8) -> Self {
        match code {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            other => RecordType::Other(other),
        }
    }
}

impl RecordType {
    pub fn code(self) -> u8 {
        match self {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::Stdin => 5,
            RecordType::Stdout => 6,
            RecordType::Stderr => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
            RecordType::UnknownType => 11,
            RecordType::Other(code) => code,
        }
    }
}

/// One FastCGI record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordType,
    pub request_id: u16,
    pub content: Bytes,
}

impl Record {
    /// Content longer than [`MAX_CONTENT_LEN`] is truncated; use
    /// [`stream_records`] to split large payloads.
    pub fn new(kind: RecordType, request_id: u16, content: impl Into<Bytes>) -> Self {
        let mut content: Bytes = content.into();
        content.truncate(MAX_CONTENT_LEN);
        Self {
            kind,
            request_id,
            content,
        }
    }

    /// Append the wire form, padded to a multiple of eight bytes.
    pub fn encode(&self, dst: &mut BytesMut) {
        let len = self.content.len();
        let padding = (8 - len % 8) % 8;
        dst.reserve(HEADER_LEN + len + padding);
        dst.put_u8(FCGI_VERSION_1);
        dst.put_u8(self.kind.code());
        dst.put_u16(self.request_id);
        dst.put_u16(len as u16);
        dst.put_u8(padding as u8);
        dst.put_u8(0);
        dst.put_slice(&self.content);
        dst.put_bytes(0, padding);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Read one record. `Ok(None)` on a clean end of stream between records.
///
/// # Errors
///
/// `UnexpectedEof` for a truncated record, `InvalidData` for an unsupported
/// protocol version.
pub fn read_record<R: Read>(r: &mut R) -> io::Result<Option<Record>> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match r.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    let mut head = &header[..];
    let version = head.get_u8();
    if version != FCGI_VERSION_1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported FastCGI version {version}"),
        ));
    }
    let kind = RecordType::from(head.get_u8());
    let request_id = head.get_u16();
    let content_len = head.get_u16() as usize;
    let padding_len = head.get_u8() as usize;

    let mut body = vec![0u8; content_len + padding_len];
    r.read_exact(&mut body)?;
    body.truncate(content_len);
    Ok(Some(Record {
        kind,
        request_id,
        content: Bytes::from(body),
    }))
}

fn put_length(dst: &mut BytesMut, len: usize) {
    if len < 0x80 {
        dst.put_u8(len as u8);
    } else {
        dst.put_u32(len as u32 | 0x8000_0000);
    }
}

/// Encode name-value pairs in FastCGI form.
pub fn encode_params<'a, I>(pairs: I) -> BytesMut
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut dst = BytesMut::new();
    for (name, value) in pairs {
        put_length(&mut dst, name.len());
        put_length(&mut dst, value.len());
        dst.put_slice(name.as_bytes());
        dst.put_slice(value.as_bytes());
    }
    dst
}

fn get_length(src: &mut &[u8]) -> io::Result<usize> {
    let first = *src.first().ok_or_else(truncated_params)?;
    if first & 0x80 == 0 {
        src.advance(1);
        return Ok(first as usize);
    }
    if src.remaining() < 4 {
        return Err(truncated_params());
    }
    Ok((src.get_u32() & 0x7fff_ffff) as usize)
}

fn truncated_params() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "truncated FastCGI name-value pair")
}

/// Decode a complete PARAMS (or GET_VALUES) stream.
///
/// # Errors
///
/// `InvalidData` when a length runs past the end of the buffer.
pub fn decode_params(mut src: &[u8]) -> io::Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    while src.has_remaining() {
        let name_len = get_length(&mut src)?;
        let value_len = get_length(&mut src)?;
        if src.remaining() < name_len + value_len {
            return Err(truncated_params());
        }
        let name = String::from_utf8_lossy(&src[..name_len]).into_owned();
        let value = String::from_utf8_lossy(&src[name_len..name_len + value_len]).into_owned();
        src.advance(name_len + value_len);
        pairs.push((name, value));
    }
    Ok(pairs)
}

/// Parsed `BEGIN_REQUEST` body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    pub role: u16,
    pub keep_conn: bool,
}

impl BeginRequest {
    /// # Errors
    ///
    /// `InvalidData` for a body shorter than eight bytes.
    pub fn parse(mut content: &[u8]) -> io::Result<Self> {
        if content.len() < 8 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "short BEGIN_REQUEST body",
            ));
        }
        let role = content.get_u16();
        let flags = content.get_u8();
        Ok(Self {
            role,
            keep_conn: flags & FLAG_KEEP_CONN != 0,
        })
    }

    pub fn to_record(self, request_id: u16) -> Record {
        let mut body = BytesMut::with_capacity(8);
        body.put_u16(self.role);
        body.put_u8(if self.keep_conn { FLAG_KEEP_CONN } else { 0 });
        body.put_bytes(0, 5);
        Record::new(RecordType::BeginRequest, request_id, body.freeze())
    }
}

pub fn end_request(request_id: u16, app_status: u32, protocol_status: u8) -> Record {
    let mut body = BytesMut::with_capacity(8);
    body.put_u32(app_status);
    body.put_u8(protocol_status);
    body.put_bytes(0, 3);
    Record::new(RecordType::EndRequest, request_id, body.freeze())
}

pub fn unknown_type(kind: RecordType) -> Record {
    let mut body = BytesMut::with_capacity(8);
    body.put_u8(kind.code());
    body.put_bytes(0, 7);
    Record::new(RecordType::UnknownType, 0, body.freeze())
}

/// Split `data` into stream records followed by the empty terminator.
pub fn stream_records(kind: RecordType, request_id: u16, data: &[u8]) -> Vec<Record> {
    let mut records: Vec<Record> = data
        .chunks(MAX_CONTENT_LEN)
        .map(|chunk| Record::new(kind, request_id, Bytes::copy_from_slice(chunk)))
        .collect();
    records.push(Record::new(kind, request_id, Bytes::new()));
    records
}

fn write_records<W: Write>(w: &mut W, records: &[Record]) -> io::Result<()> {
    let mut buf = BytesMut::new();
    for record in records {
        record.encode(&mut buf);
    }
    w.write_all(&buf)?;
    w.flush()
}

struct PendingRequest {
    id: u16,
    keep_conn: bool,
    params: BytesMut,
    stdin: Vec<u8>,
    oversized: bool,
}

impl PendingRequest {
    fn new(id: u16, keep_conn: bool) -> Self {
        Self {
            id,
            keep_conn,
            params: BytesMut::new(),
            stdin: Vec::new(),
            oversized: false,
        }
    }

    /// Append stream content, dropping it once `limit` would be passed.
    fn append(buf: &mut Vec<u8>, oversized: &mut bool, content: &[u8], limit: usize) {
        if *oversized || buf.len() + content.len() > limit {
            *oversized = true;
            buf.clear();
        } else {
            buf.extend_from_slice(content);
        }
    }
}

/// Serve one FastCGI connection until the peer closes it or a request
/// without `FCGI_KEEP_CONN` completes.
///
/// # Errors
///
/// I/O and framing errors; the caller drops the connection.
pub fn serve_connection<S: Read + Write>(
    stream: S,
    dispatcher: &RequestDispatcher,
) -> io::Result<()> {
    let mut conn = BufReader::new(stream);
    let mut current: Option<PendingRequest> = None;

    while let Some(record) = read_record(&mut conn)? {
        let id = record.request_id;
        match record.kind {
            RecordType::GetValues => {
                let reply = get_values_result(&record.content, dispatcher)?;
                write_records(conn.get_mut(), &[reply])?;
            }
            RecordType::BeginRequest => {
                let begin = BeginRequest::parse(&record.content)?;
                if current.is_some() {
                    write_records(conn.get_mut(), &[end_request(id, 0, CANT_MPX_CONN)])?;
                    continue;
                }
                if begin.role != ROLE_RESPONDER {
                    debug!(request_id = id, role = begin.role, "Unsupported FastCGI role");
                    write_records(conn.get_mut(), &[end_request(id, 0, UNKNOWN_ROLE)])?;
                    if !begin.keep_conn {
                        return Ok(());
                    }
                    continue;
                }
                current = Some(PendingRequest::new(id, begin.keep_conn));
            }
            RecordType::Params => {
                if let Some(pending) = current.as_mut().filter(|p| p.id == id) {
                    let len = pending.params.len() + record.content.len();
                    if pending.oversized || len > MAX_PARAMS_LEN {
                        pending.oversized = true;
                        pending.params.clear();
                    } else {
                        pending.params.extend_from_slice(&record.content);
                    }
                }
            }
            RecordType::Stdin => match current.take() {
                Some(mut pending) if pending.id == id => {
                    if record.content.is_empty() {
                        let keep_conn = pending.keep_conn;
                        respond(conn.get_mut(), pending, dispatcher)?;
                        if !keep_conn {
                            return Ok(());
                        }
                    } else {
                        PendingRequest::append(
                            &mut pending.stdin,
                            &mut pending.oversized,
                            &record.content,
                            MAX_STDIN_LEN,
                        );
                        current = Some(pending);
                    }
                }
                other => current = other,
            },
            RecordType::AbortRequest => match current.take() {
                Some(pending) if pending.id == id => {
                    debug!(request_id = id, "FastCGI request aborted before dispatch");
                    write_records(conn.get_mut(), &[end_request(id, 0, REQUEST_COMPLETE)])?;
                    if !pending.keep_conn {
                        return Ok(());
                    }
                }
                other => current = other,
            },
            RecordType::Data => {}
            kind if id == 0 => {
                write_records(conn.get_mut(), &[unknown_type(kind)])?;
            }
            kind => {
                debug!(request_id = id, record_type = kind.code(), "Ignoring FastCGI record");
            }
        }
    }
    Ok(())
}

fn respond<W: Write>(
    w: &mut W,
    pending: PendingRequest,
    dispatcher: &RequestDispatcher,
) -> io::Result<()> {
    let response = if pending.oversized {
        warn!(request_id = pending.id, "FastCGI request exceeds size limits");
        Response::error(413, "Payload Too Large")
    } else {
        match decode_params(&pending.params) {
            Ok(pairs) => {
                let params: HashMap<String, String> = pairs.into_iter().collect();
                dispatcher.serve(Request::from_cgi(&params, pending.stdin))
            }
            Err(e) => {
                warn!(request_id = pending.id, error = %e, "Malformed FastCGI params");
                Response::error(400, "Bad Request")
            }
        }
    };

    let mut records = stream_records(RecordType::Stdout, pending.id, &response.to_cgi());
    records.push(end_request(pending.id, 0, REQUEST_COMPLETE));
    write_records(w, &records)
}

fn get_values_result(content: &[u8], dispatcher: &RequestDispatcher) -> io::Result<Record> {
    let config = dispatcher.pool().config();
    let max = (config.workers + config.queue_depth).to_string();
    let mut answers: Vec<(&str, &str)> = Vec::new();
    for (name, _) in decode_params(content)? {
        match name.as_str() {
            "FCGI_MAX_CONNS" => answers.push(("FCGI_MAX_CONNS", &max)),
            "FCGI_MAX_REQS" => answers.push(("FCGI_MAX_REQS", &max)),
            "FCGI_MPXS_CONNS" => answers.push(("FCGI_MPXS_CONNS", "0")),
            _ => {}
        }
    }
    Ok(Record::new(
        RecordType::GetValuesResult,
        0,
        encode_params(answers).freeze(),
    ))
}

/// Bind `addr` and serve FastCGI on a background coroutine.
///
/// # Errors
///
/// An invalid address, a bind failure, or a refused coroutine spawn.
pub fn start_fastcgi(
    dispatcher: RequestDispatcher,
    addr: &str,
) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(resolve(addr)?)?;
    let local = listener.local_addr()?;
    let handle = spawn_coroutine(format!("fcgi-listener-{local}"), 0, move || {
        accept_loop(&listener, &dispatcher);
    })
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    info!(addr = %local, "FastCGI listener started");
    Ok((local, handle))
}

fn accept_loop(listener: &TcpListener, dispatcher: &RequestDispatcher) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "FastCGI accept failed");
                continue;
            }
        };
        let dispatcher = dispatcher.clone();
        let spawned = spawn_coroutine("fcgi-conn".to_string(), 0, move || {
            if let Err(e) = serve_connection(stream, &dispatcher) {
                debug!(error = %e, "FastCGI connection closed with error");
            }
        });
        if let Err(e) = spawned {
            error!(error = %e, "Failed to spawn FastCGI connection coroutine");
        }
    }
}
