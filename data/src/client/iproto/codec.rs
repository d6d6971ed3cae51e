//! Encoding and decoding of IPROTO packets.
//!
//! Every packet is a MessagePack unsigned integer giving the length of the rest of the packet,
//! followed by a header map and a body map. Keys of both maps are small integer constants.

use super::Error;
use crate::client::{Error as _, ErrorKind, FieldMetadata, IndexMetadata, SpaceMetadata};
use base64::{engine::general_purpose::STANDARD, Engine};
use rmpv::Value;
use sha1::{Digest, Sha1};

/// Size of the greeting sent by the server when a connection is opened.
pub const GREETING_SIZE: usize = 128;
/// Size of the length prefix of a packet.
pub const LENGTH_SIZE: usize = 5;
/// Largest packet accepted from the server.
pub const MAX_PACKET_SIZE: usize = 256 * 1024 * 1024;

/// Request types.
pub mod code {
    pub const SELECT: u8 = 1;
    pub const INSERT: u8 = 2;
    pub const REPLACE: u8 = 3;
    pub const UPDATE: u8 = 4;
    pub const DELETE: u8 = 5;
    pub const AUTH: u8 = 7;
    pub const EVAL: u8 = 8;
    pub const UPSERT: u8 = 9;
    pub const CALL: u8 = 10;
    pub const PING: u8 = 64;
}

/// Keys of header and body maps.
pub mod key {
    pub const REQUEST_TYPE: u8 = 0x00;
    pub const SYNC: u8 = 0x01;
    pub const SPACE_ID: u8 = 0x10;
    pub const INDEX_ID: u8 = 0x11;
    pub const LIMIT: u8 = 0x12;
    pub const OFFSET: u8 = 0x13;
    pub const ITERATOR: u8 = 0x14;
    pub const KEY: u8 = 0x20;
    pub const TUPLE: u8 = 0x21;
    pub const FUNCTION_NAME: u8 = 0x22;
    pub const USER_NAME: u8 = 0x23;
    pub const EXPR: u8 = 0x27;
    pub const OPS: u8 = 0x28;
    pub const DATA: u8 = 0x30;
    pub const ERROR_24: u8 = 0x31;
    pub const ERROR: u8 = 0x52;
}

/// Index iterator types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IteratorType {
    Eq = 0,
    All = 2,
    Lt = 3,
    Le = 4,
    Ge = 5,
    Gt = 6,
}

/// System space listing the spaces visible to the current user.
pub const VSPACE_ID: u32 = 281;
/// System space listing the indexes visible to the current user.
pub const VINDEX_ID: u32 = 289;

/// Response code bit marking an error.
const ERROR_BIT: u64 = 0x8000;

/// Contents of the server greeting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Greeting {
    /// The first line of the greeting, identifying the server.
    pub version: String,
    /// Random salt for authentication.
    pub salt: Vec<u8>,
}

impl Greeting {
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < GREETING_SIZE {
            return Err(Error::new(
                ErrorKind::Connection,
                format!("greeting is too short ({} bytes)", bytes.len()),
            ));
        }
        let version = String::from_utf8_lossy(&bytes[..64]).trim().to_string();
        let salt = std::str::from_utf8(&bytes[64..108])
            .map_err(|err| Error::new(ErrorKind::Connection, format!("malformed salt: {err}")))?;
        let salt = STANDARD
            .decode(salt.trim())
            .map_err(|err| Error::new(ErrorKind::Connection, format!("malformed salt: {err}")))?;
        Ok(Self { version, salt })
    }
}

/// The `chap-sha1` scramble of `password` with the greeting salt.
pub fn scramble(salt: &[u8], password: &str) -> Vec<u8> {
    let hash1 = Sha1::digest(password.as_bytes());
    let hash2 = Sha1::digest(hash1);
    let mut hasher = Sha1::new();
    hasher.update(&salt[..salt.len().min(20)]);
    hasher.update(hash2);
    let hash3 = hasher.finalize();
    hash1.iter().zip(hash3).map(|(a, b)| a ^ b).collect()
}

fn int_map(entries: impl IntoIterator<Item = (u8, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::from(k), v))
            .collect(),
    )
}

fn write(buf: &mut Vec<u8>, value: &Value) -> Result<(), Error> {
    rmpv::encode::write_value(buf, value)
        .map_err(|err| Error::new(ErrorKind::Internal, format!("encoding request: {err}")))
}

/// Encode a complete request packet.
pub fn encode_request(request: u8, sync: u64, body: Vec<(u8, Value)>) -> Result<Vec<u8>, Error> {
    let mut payload = vec![];
    write(
        &mut payload,
        &int_map([
            (key::REQUEST_TYPE, Value::from(request)),
            (key::SYNC, Value::from(sync)),
        ]),
    )?;
    write(&mut payload, &int_map(body))?;

    let len = u32::try_from(payload.len())
        .map_err(|_| Error::new(ErrorKind::Internal, "request is too large"))?;
    let mut packet = Vec::with_capacity(LENGTH_SIZE + payload.len());
    packet.push(0xce);
    packet.extend_from_slice(&len.to_be_bytes());
    packet.extend(payload);
    Ok(packet)
}

/// Decode the length prefix of a packet.
///
/// Lengths above [`MAX_PACKET_SIZE`] are rejected before anything is allocated for the packet.
pub fn decode_length(mut bytes: &[u8]) -> Result<usize, Error> {
    let len = rmpv::decode::read_value(&mut bytes)
        .ok()
        .and_then(|len| len.as_u64())
        .ok_or_else(|| Error::new(ErrorKind::Connection, "malformed packet length"))?;
    if len > MAX_PACKET_SIZE as u64 {
        return Err(Error::new(
            ErrorKind::Connection,
            format!("packet of {len} bytes exceeds the limit of {MAX_PACKET_SIZE}"),
        ));
    }
    Ok(len as usize)
}

/// A decoded response packet.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub code: u64,
    pub sync: u64,
    pub body: Value,
}

fn map_get(map: &Value, key: u8) -> Option<&Value> {
    map.as_map()?
        .iter()
        .find(|(k, _)| k.as_u64() == Some(key as u64))
        .map(|(_, v)| v)
}

fn str_get<'a>(map: &'a Value, key: &str) -> Option<&'a Value> {
    map.as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

impl Response {
    /// Decode a response from the bytes following its length prefix.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, Error> {
        let malformed = |err: rmpv::decode::Error| {
            Error::new(ErrorKind::Connection, format!("malformed response: {err}"))
        };
        let header = rmpv::decode::read_value(&mut bytes).map_err(malformed)?;
        let body = if bytes.is_empty() {
            Value::Map(vec![])
        } else {
            rmpv::decode::read_value(&mut bytes).map_err(malformed)?
        };
        let field = |key| map_get(&header, key).and_then(Value::as_u64);
        match (field(key::REQUEST_TYPE), field(key::SYNC)) {
            (Some(code), Some(sync)) => Ok(Self { code, sync, body }),
            _ => Err(Error::new(
                ErrorKind::Connection,
                format!("malformed response header {header}"),
            )),
        }
    }

    /// The data of a successful response, or the error reported by the server.
    pub fn into_result(self) -> Result<Vec<Value>, Error> {
        if self.code & ERROR_BIT == 0 {
            return match map_get(&self.body, key::DATA) {
                Some(Value::Array(data)) => Ok(data.clone()),
                Some(other) => Err(Error::new(
                    ErrorKind::Internal,
                    format!("unexpected response data {other}"),
                )),
                None => Ok(vec![]),
            };
        }
        let errcode = self.code & !ERROR_BIT;
        Err(Error::new(error_kind(errcode), error_message(&self.body)))
    }
}

/// The message of an error response, from the error stack if there is one.
fn error_message(body: &Value) -> String {
    let stack_message = map_get(body, key::ERROR)
        .and_then(|err| map_get(err, 0x00))
        .and_then(Value::as_array)
        .and_then(|stack| stack.first())
        .and_then(|err| map_get(err, 0x03))
        .and_then(Value::as_str);
    stack_message
        .or_else(|| map_get(body, key::ERROR_24).and_then(Value::as_str))
        .unwrap_or("unknown error")
        .to_string()
}

/// Classify a server error code.
pub fn error_kind(errcode: u64) -> ErrorKind {
    match errcode {
        32 => ErrorKind::Function,
        33 => ErrorKind::NoSuchProcedure,
        35 => ErrorKind::NoSuchIndex,
        36 => ErrorKind::NoSuchSpace,
        42 => ErrorKind::AccessDenied,
        _ => ErrorKind::SpaceOperation,
    }
}

fn metadata_error(msg: impl std::fmt::Display) -> Error {
    Error::new(ErrorKind::Metadata, msg)
}

/// Parse a tuple of `_vspace`.
pub fn parse_space(tuple: &[Value]) -> Result<SpaceMetadata, Error> {
    let id = tuple
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| metadata_error(format!("malformed space {tuple:?}")))?;
    let name = tuple
        .get(2)
        .and_then(Value::as_str)
        .ok_or_else(|| metadata_error(format!("malformed space {tuple:?}")))?;
    let format = match tuple.get(6) {
        Some(Value::Array(fields)) => fields
            .iter()
            .map(|field| {
                let name = str_get(field, "name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| metadata_error(format!("malformed field {field}")))?;
                let ty = str_get(field, "type").and_then(Value::as_str).unwrap_or("any");
                let is_nullable = str_get(field, "is_nullable")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Ok(FieldMetadata {
                    name: name.into(),
                    ty: ty.into(),
                    is_nullable,
                })
            })
            .collect::<Result<_, Error>>()?,
        _ => vec![],
    };
    Ok(SpaceMetadata::new(id as u32, name, format))
}

/// Parse a tuple of `_vindex`, returning the ID of the indexed space along with the index.
pub fn parse_index(tuple: &[Value]) -> Result<(u32, IndexMetadata), Error> {
    let malformed = || metadata_error(format!("malformed index {tuple:?}"));
    let space_id = tuple.first().and_then(Value::as_u64).ok_or_else(malformed)?;
    let id = tuple.get(1).and_then(Value::as_u64).ok_or_else(malformed)?;
    let name = tuple.get(2).and_then(Value::as_str).ok_or_else(malformed)?;
    let unique = tuple
        .get(4)
        .and_then(|opts| str_get(opts, "unique"))
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let parts = tuple
        .get(5)
        .and_then(Value::as_array)
        .ok_or_else(malformed)?
        .iter()
        .map(|part| {
            let field = match part {
                Value::Array(part) => part.first(),
                part => str_get(part, "field"),
            };
            field
                .and_then(Value::as_u64)
                .map(|field| field as usize)
                .ok_or_else(malformed)
        })
        .collect::<Result<_, _>>()?;
    Ok((
        space_id as u32,
        IndexMetadata::new(id as u32, name, unique, parts),
    ))
}
