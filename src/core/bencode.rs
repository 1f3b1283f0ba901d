//! # Bencode Codec
//!
//! Length-prefixed binary encoding used for every value on the M2M wire.
//!
//! ## Grammar
//! ```text
//! byte string : <decimal length>:<raw bytes>     4:spam
//! integer     : i<optional '-'><digits>e         i-42e
//! list        : l<items>e                        li1e3:fooe
//! map         : d<key><value>...e                d3:foo3:bare
//! ```
//!
//! Map keys are byte strings and are always emitted in ascending byte order,
//! so two equal logical maps serialize identically. Text is not a distinct
//! wire type: `&str`/`String` convert into UTF-8 byte strings.
//!
//! ## Decoding
//! The parser walks the input once. Delimiters (`:` after a length prefix,
//! `e` after an integer) are located with a bounded lookahead, so no byte is
//! rescanned beyond that window. An `e` where a value is expected marks the
//! end of a container and never escapes to callers as a value.
//!
//! Short inputs may be served from an LRU cache via [`CachingDecoder`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use bytes::Bytes;
use tracing::trace;

use crate::error::{constants, ProtocolError, Result};
use crate::utils::lru_cache::{LruCache, LruStats};

/// Default limit on container nesting for encode and decode
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Inputs shorter than this many bytes are eligible for the decode cache
pub const DEFAULT_CACHE_THRESHOLD: usize = 100;

/// Default number of cached decodes
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Longest accepted length prefix (digits)
const MAX_LENGTH_DIGITS: usize = 10;

/// Longest accepted integer body: "-9223372036854775808"
const MAX_INTEGER_CHARS: usize = 20;

/// A bencode map: byte-string keys in ascending order
pub type Dict = BTreeMap<Bytes, Value>;

/// The codec's universal datum.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Bytes),
    Int(i64),
    List(Vec<Value>),
    Dict(Dict),
}

impl Value {
    /// Build a map value from key/value pairs. Later duplicates win.
    pub fn dict<K, V, I>(entries: I) -> Self
    where
        K: AsRef<[u8]>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (Bytes::copy_from_slice(k.as_ref()), v.into()))
                .collect(),
        )
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The byte string as UTF-8 text, if it is both.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Short name of the variant, for error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Bytes(_) => "bytes",
            Value::Int(_) => "int",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bytes(b) => write!(f, "b\"{}\"", b.escape_ascii()),
            Value::Int(i) => write!(f, "{i}"),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Dict(map) => f
                .debug_map()
                .entries(map.iter().map(|(k, v)| (Value::Bytes(k.clone()), v)))
                .finish(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bytes(Bytes::from(s.into_bytes()))
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(b))
    }
}

impl<const N: usize> From<&[u8; N]> for Value {
    fn from(b: &[u8; N]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(b))
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Dict> for Value {
    fn from(map: Dict) -> Self {
        Value::Dict(map)
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a value with the default nesting limit.
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    encode_with_depth(value, DEFAULT_MAX_DEPTH)
}

/// Encode a value, failing with `Encode` if containers nest deeper than `max_depth`.
pub fn encode_with_depth(value: &Value, max_depth: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    encode_into(value, &mut out, 0, max_depth)?;
    Ok(out)
}

fn encode_into(value: &Value, out: &mut Vec<u8>, depth: usize, max_depth: usize) -> Result<()> {
    match value {
        Value::Bytes(b) => write_bytes(b, out),
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::List(items) => {
            check_depth(depth, max_depth).map_err(ProtocolError::Encode)?;
            out.push(b'l');
            for item in items {
                encode_into(item, out, depth + 1, max_depth)?;
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            check_depth(depth, max_depth).map_err(ProtocolError::Encode)?;
            out.push(b'd');
            // BTreeMap iteration is already ascending byte order
            for (key, item) in map {
                write_bytes(key, out);
                encode_into(item, out, depth + 1, max_depth)?;
            }
            out.push(b'e');
        }
    }
    Ok(())
}

#[inline]
fn write_bytes(b: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(b.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(b);
}

#[inline]
fn check_depth(depth: usize, max_depth: usize) -> std::result::Result<(), String> {
    if depth >= max_depth {
        Err(constants::ERR_DEPTH_EXCEEDED.to_string())
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Outcome of a bounded delimiter search
enum Lookahead {
    Found(usize),
    /// Ran out of input before the window closed
    Incomplete,
    /// Window exhausted without the delimiter
    Missing,
}

/// Search `data[start..start + window + 1]` for `delim`.
#[inline]
fn find_delimiter(data: &[u8], start: usize, delim: u8, window: usize) -> Lookahead {
    let end = (start + window + 1).min(data.len());
    if start > end {
        return Lookahead::Incomplete;
    }
    match data[start..end].iter().position(|&b| b == delim) {
        Some(offset) => Lookahead::Found(start + offset),
        None if end == data.len() && end < start + window + 1 => Lookahead::Incomplete,
        None => Lookahead::Missing,
    }
}

fn parse_integer(text: &[u8]) -> Result<i64> {
    let digits = text.strip_prefix(b"-").unwrap_or(text);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::Decode(constants::ERR_INVALID_INTEGER.into()));
    }
    std::str::from_utf8(text)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ProtocolError::Decode("integer out of range".into()))
}

fn parse_length(text: &[u8]) -> Result<usize> {
    if text.is_empty() || !text.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::Decode(constants::ERR_ILLEGAL_SIZE.into()));
    }
    std::str::from_utf8(text)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| ProtocolError::Decode("illegal size".into()))
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
    max_depth: usize,
}

impl<'a> Parser<'a> {
    fn unexpected_end() -> ProtocolError {
        ProtocolError::Decode(constants::ERR_UNEXPECTED_END.into())
    }

    /// Next value, or `None` on an end-of-container marker.
    fn next(&mut self, depth: usize) -> Result<Option<Value>> {
        let tag = *self.data.get(self.pos).ok_or_else(Self::unexpected_end)?;
        match tag {
            b'0'..=b'9' => self.byte_string().map(Some),
            b'i' => self.integer().map(Some),
            b'l' => self.list(depth).map(Some),
            b'd' => self.dict(depth).map(Some),
            b'e' => {
                self.pos += 1;
                Ok(None)
            }
            other => Err(ProtocolError::Decode(format!(
                "invalid type marker 0x{other:02x} at offset {}",
                self.pos
            ))),
        }
    }

    fn byte_string(&mut self) -> Result<Value> {
        let colon = match find_delimiter(self.data, self.pos, b':', MAX_LENGTH_DIGITS) {
            Lookahead::Found(idx) => idx,
            Lookahead::Incomplete => return Err(Self::unexpected_end()),
            Lookahead::Missing => {
                return Err(ProtocolError::Decode(constants::ERR_ILLEGAL_SIZE.into()))
            }
        };
        let len = parse_length(&self.data[self.pos..colon])?;
        let start = colon + 1;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                ProtocolError::Decode(format!(
                    "string length {len} exceeds available bytes ({})",
                    self.data.len() - start
                ))
            })?;
        self.pos = end;
        Ok(Value::Bytes(Bytes::copy_from_slice(&self.data[start..end])))
    }

    fn integer(&mut self) -> Result<Value> {
        let start = self.pos + 1;
        let end = match find_delimiter(self.data, start, b'e', MAX_INTEGER_CHARS) {
            Lookahead::Found(idx) => idx,
            Lookahead::Incomplete => {
                return Err(ProtocolError::Decode("unterminated integer".into()))
            }
            Lookahead::Missing => {
                return Err(ProtocolError::Decode(constants::ERR_INVALID_INTEGER.into()))
            }
        };
        let value = parse_integer(&self.data[start..end])?;
        self.pos = end + 1;
        Ok(Value::Int(value))
    }

    fn list(&mut self, depth: usize) -> Result<Value> {
        check_depth(depth, self.max_depth).map_err(ProtocolError::Decode)?;
        self.pos += 1;
        let mut items = Vec::new();
        while let Some(item) = self.next(depth + 1)? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value> {
        check_depth(depth, self.max_depth).map_err(ProtocolError::Decode)?;
        self.pos += 1;
        let mut map = Dict::new();
        while let Some(key) = self.next(depth + 1)? {
            let key = match key {
                Value::Bytes(b) => b,
                other => {
                    return Err(ProtocolError::Decode(format!(
                        "dict keys must be byte strings (got {})",
                        other.kind_name()
                    )))
                }
            };
            let value = self.next(depth + 1)?.ok_or_else(|| {
                ProtocolError::Decode(format!("missing value for key {:?}", key))
            })?;
            map.insert(key, value);
        }
        Ok(Value::Dict(map))
    }
}

/// Decode exactly one bencode value from `data`.
pub fn decode(data: &[u8]) -> Result<Value> {
    decode_with_depth(data, DEFAULT_MAX_DEPTH)
}

/// Decode exactly one value, rejecting nesting deeper than `max_depth`.
pub fn decode_with_depth(data: &[u8], max_depth: usize) -> Result<Value> {
    let mut parser = Parser {
        data,
        pos: 0,
        max_depth,
    };
    let value = parser
        .next(0)?
        .ok_or_else(|| ProtocolError::Decode("unexpected end-of-container marker".into()))?;
    if parser.pos != data.len() {
        return Err(ProtocolError::Decode(format!(
            "{} trailing bytes after value",
            data.len() - parser.pos
        )));
    }
    Ok(value)
}

/// Length of the first complete value in `data`, for stream framing.
///
/// Returns `Ok(None)` when more input is needed. Structure is checked but
/// nothing is allocated; map key types are left to [`decode`].
pub fn frame_length(data: &[u8], max_depth: usize) -> Result<Option<usize>> {
    FrameScanner::default().scan(data, max_depth)
}

/// Resumable form of [`frame_length`] for buffers that grow between calls.
///
/// The scanner remembers the offset and nesting depth after the last
/// complete element, so each call only looks at bytes it has not already
/// accepted. It resets itself after a complete frame or an error; call
/// [`reset`](Self::reset) if the buffer is replaced by other means.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameScanner {
    pos: usize,
    depth: usize,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset up to which the current frame has been accepted
    pub fn checkpoint(&self) -> usize {
        self.pos
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Continue scanning `data`, which must extend the previous input.
    pub fn scan(&mut self, data: &[u8], max_depth: usize) -> Result<Option<usize>> {
        let result = self.advance(data, max_depth);
        if !matches!(result, Ok(None)) {
            self.reset();
        }
        result
    }

    fn advance(&mut self, data: &[u8], max_depth: usize) -> Result<Option<usize>> {
        loop {
            let pos = self.pos;
            let Some(&tag) = data.get(pos) else {
                return Ok(None);
            };
            match tag {
                b'i' => match find_delimiter(data, pos + 1, b'e', MAX_INTEGER_CHARS) {
                    Lookahead::Found(end) => {
                        parse_integer(&data[pos + 1..end])?;
                        self.pos = end + 1;
                    }
                    Lookahead::Incomplete => return Ok(None),
                    Lookahead::Missing => {
                        return Err(ProtocolError::Decode(constants::ERR_INVALID_INTEGER.into()))
                    }
                },
                b'0'..=b'9' => match find_delimiter(data, pos, b':', MAX_LENGTH_DIGITS) {
                    Lookahead::Found(colon) => {
                        let len = parse_length(&data[pos..colon])?;
                        let end = colon + 1 + len;
                        if end > data.len() {
                            return Ok(None);
                        }
                        self.pos = end;
                    }
                    Lookahead::Incomplete => return Ok(None),
                    Lookahead::Missing => {
                        return Err(ProtocolError::Decode(constants::ERR_ILLEGAL_SIZE.into()))
                    }
                },
                b'l' | b'd' => {
                    check_depth(self.depth, max_depth).map_err(ProtocolError::Decode)?;
                    self.depth += 1;
                    self.pos += 1;
                    continue;
                }
                b'e' if self.depth > 0 => {
                    self.depth -= 1;
                    self.pos += 1;
                }
                other => {
                    return Err(ProtocolError::Decode(format!(
                        "invalid type marker 0x{other:02x} at offset {pos}"
                    )))
                }
            }
            if self.depth == 0 {
                return Ok(Some(self.pos));
            }
        }
    }
}

/// Decoder that memoizes results for short inputs.
///
/// Inputs shorter than `threshold` bytes are looked up in (and added to) an
/// LRU cache keyed by the exact input bytes. Longer inputs bypass it.
#[derive(Debug)]
pub struct CachingDecoder {
    cache: Mutex<LruCache<Vec<u8>, Value>>,
    threshold: usize,
    max_depth: usize,
}

impl CachingDecoder {
    pub fn new(capacity: usize, threshold: usize) -> Self {
        Self::with_max_depth(capacity, threshold, DEFAULT_MAX_DEPTH)
    }

    pub fn with_max_depth(capacity: usize, threshold: usize, max_depth: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            threshold,
            max_depth,
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<Value> {
        if data.len() >= self.threshold {
            return decode_with_depth(data, self.max_depth);
        }

        if let Ok(mut cache) = self.cache.lock() {
            if let Some(value) = cache.get(data) {
                trace!(bytes = data.len(), "Decode cache hit");
                return Ok(value.clone());
            }
        }

        let value = decode_with_depth(data, self.max_depth)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(data.to_vec(), value.clone());
        }
        Ok(value)
    }

    /// Whether `data` currently has a cached decode. Does not touch recency.
    pub fn is_cached(&self, data: &[u8]) -> bool {
        self.cache
            .lock()
            .map(|cache| cache.contains(data))
            .unwrap_or(false)
    }

    pub fn stats(&self) -> LruStats {
        match self.cache.lock() {
            Ok(cache) => cache.stats(),
            Err(poisoned) => poisoned.into_inner().stats(),
        }
    }
}

impl Default for CachingDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_THRESHOLD)
    }
}
