//! Erlang external term format, mapped onto `serde_json::Value`.
//!
//! Atoms `nil`/`null`, `true` and `false` become JSON null and booleans; other
//! atoms and binaries become strings; tuples and lists become arrays. Integers
//! wider than 64 bits are rendered as decimal strings.

use serde_json::{Map, Number, Value};

use crate::error::CodecError;

const FORMAT_VERSION: u8 = 131;
const NEW_FLOAT_EXT: u8 = 70;
const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const FLOAT_EXT: u8 = 99;
const ATOM_EXT: u8 = 100;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const LARGE_BIG_EXT: u8 = 111;
const SMALL_ATOM_EXT: u8 = 115;
const MAP_EXT: u8 = 116;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

const MAX_DEPTH: usize = 256;

pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = vec![FORMAT_VERSION];
    encode_term(value, &mut out);
    out
}

fn encode_term(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => encode_atom("nil", out),
        Value::Bool(true) => encode_atom("true", out),
        Value::Bool(false) => encode_atom("false", out),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                encode_integer(u as i128, out);
            } else if let Some(i) = n.as_i64() {
                encode_integer(i as i128, out);
            } else {
                out.push(NEW_FLOAT_EXT);
                out.extend_from_slice(&n.as_f64().unwrap_or_default().to_be_bytes());
            }
        }
        Value::String(s) => encode_binary(s, out),
        Value::Array(items) => {
            if !items.is_empty() {
                out.push(LIST_EXT);
                out.extend_from_slice(&(items.len() as u32).to_be_bytes());
                for item in items {
                    encode_term(item, out);
                }
            }
            out.push(NIL_EXT);
        }
        Value::Object(map) => {
            out.push(MAP_EXT);
            out.extend_from_slice(&(map.len() as u32).to_be_bytes());
            for (key, value) in map {
                encode_binary(key, out);
                encode_term(value, out);
            }
        }
    }
}

fn encode_atom(name: &str, out: &mut Vec<u8>) {
    out.push(SMALL_ATOM_UTF8_EXT);
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
}

fn encode_binary(s: &str, out: &mut Vec<u8>) {
    out.push(BINARY_EXT);
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn encode_integer(value: i128, out: &mut Vec<u8>) {
    if (0..=255).contains(&value) {
        out.push(SMALL_INTEGER_EXT);
        out.push(value as u8);
    } else if (i32::MIN as i128..=i32::MAX as i128).contains(&value) {
        out.push(INTEGER_EXT);
        out.extend_from_slice(&(value as i32).to_be_bytes());
    } else {
        let mut magnitude = value.unsigned_abs();
        let mut digits = Vec::with_capacity(16);
        while magnitude > 0 {
            digits.push((magnitude & 0xff) as u8);
            magnitude >>= 8;
        }
        out.push(SMALL_BIG_EXT);
        out.push(digits.len() as u8);
        out.push(u8::from(value < 0));
        out.extend_from_slice(&digits);
    }
}

pub fn decode(data: &[u8]) -> Result<Value, CodecError> {
    let mut reader = Reader { data, pos: 0 };
    let version = reader.u8()?;
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    reader.term(0)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if n > self.remaining() {
            return Err(CodecError::Truncated);
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn term(&mut self, depth: usize) -> Result<Value, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::Invalid("term nested too deeply".to_string()));
        }

        let tag = self.u8()?;
        match tag {
            SMALL_INTEGER_EXT => Ok(Value::from(self.u8()?)),
            INTEGER_EXT => Ok(Value::from(self.u32()? as i32)),
            NEW_FLOAT_EXT => {
                let b = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Ok(float(f64::from_be_bytes(raw)))
            }
            FLOAT_EXT => {
                let b = self.take(31)?;
                let text = String::from_utf8_lossy(b);
                let parsed = text
                    .trim_end_matches('\0')
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| CodecError::Invalid(format!("bad float: {e}")))?;
                Ok(float(parsed))
            }
            ATOM_EXT | ATOM_UTF8_EXT => {
                let len = self.u16()? as usize;
                Ok(atom(self.take(len)?))
            }
            SMALL_ATOM_EXT | SMALL_ATOM_UTF8_EXT => {
                let len = self.u8()? as usize;
                Ok(atom(self.take(len)?))
            }
            SMALL_TUPLE_EXT => {
                let arity = self.u8()? as usize;
                self.elements(arity, depth)
            }
            LARGE_TUPLE_EXT => {
                let arity = self.u32()? as usize;
                self.elements(arity, depth)
            }
            NIL_EXT => Ok(Value::Array(Vec::new())),
            STRING_EXT => {
                let len = self.u16()? as usize;
                Ok(Value::Array(
                    self.take(len)?.iter().map(|b| Value::from(*b)).collect(),
                ))
            }
            LIST_EXT => {
                let len = self.u32()? as usize;
                let mut items = match self.elements(len, depth)? {
                    Value::Array(items) => items,
                    _ => unreachable!("elements always yields an array"),
                };
                match self.term(depth + 1)? {
                    Value::Array(tail) if tail.is_empty() => {}
                    tail => items.push(tail),
                }
                Ok(Value::Array(items))
            }
            BINARY_EXT => {
                let len = self.u32()? as usize;
                Ok(Value::String(
                    String::from_utf8_lossy(self.take(len)?).into_owned(),
                ))
            }
            SMALL_BIG_EXT => {
                let n = self.u8()? as usize;
                self.big(n)
            }
            LARGE_BIG_EXT => {
                let n = self.u32()? as usize;
                self.big(n)
            }
            MAP_EXT => {
                let arity = self.u32()? as usize;
                let mut map = Map::new();
                for _ in 0..arity {
                    let key = match self.term(depth + 1)? {
                        Value::String(s) => s,
                        Value::Null => "nil".to_string(),
                        other => other.to_string(),
                    };
                    let value = self.term(depth + 1)?;
                    map.insert(key, value);
                }
                Ok(Value::Object(map))
            }
            other => Err(CodecError::UnknownTag(other)),
        }
    }

    fn elements(&mut self, count: usize, depth: usize) -> Result<Value, CodecError> {
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            items.push(self.term(depth + 1)?);
        }
        Ok(Value::Array(items))
    }

    fn big(&mut self, n: usize) -> Result<Value, CodecError> {
        let sign = self.u8()?;
        let digits = self.take(n)?;
        if digits.iter().skip(16).any(|d| *d != 0) {
            return Err(CodecError::Invalid("integer wider than 128 bits".to_string()));
        }

        let magnitude = digits
            .iter()
            .take(16)
            .enumerate()
            .fold(0u128, |acc, (i, d)| acc | ((*d as u128) << (8 * i)));

        if sign == 0 {
            Ok(match u64::try_from(magnitude) {
                Ok(v) => Value::Number(Number::from(v)),
                Err(_) => Value::String(magnitude.to_string()),
            })
        } else {
            Ok(match i64::try_from(magnitude) {
                Ok(v) => Value::Number(Number::from(-v)),
                Err(_) if magnitude == i64::MIN.unsigned_abs() as u128 => {
                    Value::Number(Number::from(i64::MIN))
                }
                Err(_) => Value::String(format!("-{magnitude}")),
            })
        }
    }
}

fn atom(bytes: &[u8]) -> Value {
    match bytes {
        b"nil" | b"null" => Value::Null,
        b"true" => Value::Bool(true),
        b"false" => Value::Bool(false),
        other => Value::String(String::from_utf8_lossy(other).into_owned()),
    }
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}
