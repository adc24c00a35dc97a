//! Checkpoint reader: the exact dual of the writer
//!
//! Objects are materialized on first reference. Containers store a shell
//! in their slot before reading their elements, so cyclic references
//! resolve to the shell and restore as a single shared object.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::checkpoint::buffer::ByteReader;
use crate::checkpoint::{tag, CODEC_VERSION};
use crate::error::{RunResult, RuntimeError};
use crate::num;
use crate::object::{ArrayData, ArrayKind, Instance, TypedArray};
use crate::registry;
use crate::rxmatch::RegexMatcher;
use crate::suspend::{FunctionValue, IterValue};
use crate::value::{Value, ValueMap};

/// Restores values from a checkpoint image
pub struct CheckpointReader<'a> {
    buf: ByteReader<'a>,
    version: u32,
    table: Vec<i32>,
    slots: Vec<Option<Value>>,
}

impl<'a> CheckpointReader<'a> {
    /// Parse the header and offset table.
    ///
    /// An image written by a newer codec version is a hard failure; an
    /// older image is accepted, and tags unknown to this binary restore
    /// as null only in that case.
    pub fn new(bytes: &'a [u8]) -> RunResult<Self> {
        let mut buf = ByteReader::new(bytes);
        let version = buf.read_cint()? as u32;
        if version > CODEC_VERSION {
            return Err(RuntimeError::msg(format!(
                "Checkpoint version {} is newer than supported version {}",
                version, CODEC_VERSION
            )));
        }
        let count = buf.read_i32_le()?;
        if count < 0 {
            return Err(RuntimeError::msg("Corrupt checkpoint: negative object count"));
        }
        let table_offset = buf.read_i32_le()?;
        let body_pos = buf.position();

        let mut table = Vec::with_capacity(count as usize);
        buf.seek(table_offset as usize)?;
        for _ in 0..count {
            table.push(buf.read_i32_le()?);
        }
        buf.seek(body_pos)?;

        Ok(Self {
            buf,
            version,
            slots: vec![None; table.len()],
            table,
        })
    }

    /// Version of the image being read
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Read one value (inline or object reference)
    pub fn read_value(&mut self) -> RunResult<Value> {
        let t = self.buf.read_u8()?;
        match t {
            tag::NULL => Ok(Value::Null),
            tag::BOOL => Ok(Value::Bool(self.buf.read_u8()? != 0)),
            tag::INT => Ok(Value::Int(self.buf.read_cint()?)),
            tag::LONG => Ok(Value::Long(self.buf.read_clong()?)),
            tag::FLOAT => Ok(Value::Float(self.buf.read_f64_bits()?)),
            tag::DECIMAL => {
                let s = self.buf.read_str()?;
                num::decimal_from_str(&s)
            }
            tag::ANY => {
                let id = self.buf.read_cint()?;
                self.read_object(id)
            }
            unknown => self.unknown_tag(unknown),
        }
    }

    fn unknown_tag(&self, t: u8) -> RunResult<Value> {
        if self.version < CODEC_VERSION {
            // Forward tolerance: older images may carry tags this binary
            // no longer understands
            Ok(Value::Null)
        } else {
            Err(RuntimeError::msg(format!(
                "Corrupt checkpoint: unknown tag {}",
                t
            )))
        }
    }

    fn read_object(&mut self, id: i32) -> RunResult<Value> {
        if id < 0 || id as usize >= self.table.len() {
            return Err(RuntimeError::msg(format!(
                "Corrupt checkpoint: object id {} out of range",
                id
            )));
        }
        let idx = id as usize;
        if let Some(v) = &self.slots[idx] {
            return Ok(v.clone());
        }

        let saved = self.buf.position();
        self.buf.seek(self.table[idx] as usize)?;
        let result = self.read_body(idx);
        self.buf.seek(saved)?;
        result
    }

    fn read_body(&mut self, idx: usize) -> RunResult<Value> {
        let t = self.buf.read_u8()?;
        let value = match t {
            tag::STRING => {
                let s = self.buf.read_str()?;
                let v = Value::str(s);
                self.slots[idx] = Some(v.clone());
                v
            }
            tag::LIST => {
                let n = self.read_len()?;
                let list = Arc::new(Mutex::new(Vec::with_capacity(n)));
                self.slots[idx] = Some(Value::List(list.clone()));
                for _ in 0..n {
                    let item = self.read_value()?;
                    list.lock().push(item);
                }
                Value::List(list)
            }
            tag::MAP => {
                let n = self.read_len()?;
                let map = Arc::new(Mutex::new(ValueMap::new()));
                self.slots[idx] = Some(Value::Map(map.clone()));
                for _ in 0..n {
                    let key = match self.read_value()? {
                        Value::Str(s) => s.to_string(),
                        other => {
                            return Err(RuntimeError::msg(format!(
                                "Corrupt checkpoint: map key is {}",
                                other.type_name()
                            )))
                        }
                    };
                    let val = self.read_value()?;
                    map.lock().insert(key, val);
                }
                Value::Map(map)
            }
            tag::ARRAY => {
                let arr = self.read_array_body(idx)?;
                arr
            }
            tag::INSTANCE => {
                let class = self.buf.read_str()?;
                let shape = registry::lookup_class(&class)?;
                let n = self.read_len()?;
                if n != shape.fields.len() {
                    return Err(RuntimeError::msg(format!(
                        "Checkpoint instance of {} has {} fields, class declares {}",
                        class,
                        n,
                        shape.fields.len()
                    )));
                }
                let inst = Arc::new(Mutex::new(Instance::new(shape)));
                self.slots[idx] = Some(Value::Instance(inst.clone()));
                for i in 0..n {
                    let v = self.read_value()?;
                    inst.lock().fields[i] = v;
                }
                Value::Instance(inst)
            }
            tag::FUNCTION => {
                let name = self.buf.read_str()?;
                let factory = registry::lookup_callback_factory(&name)?;
                let cb = factory(self)?;
                let v = Value::Function(FunctionValue::from_box(cb));
                self.slots[idx] = Some(v.clone());
                v
            }
            tag::ITERATOR => {
                let kind = self.buf.read_str()?;
                let reader_fn = registry::lookup_iter_reader(&kind)?;
                let it = reader_fn(self)?;
                let v = Value::Iterator(IterValue::from_box(it));
                self.slots[idx] = Some(v.clone());
                v
            }
            tag::STRING_BUILDER => {
                let s = self.buf.read_str()?;
                let v = Value::StringBuilder(Arc::new(Mutex::new(s)));
                self.slots[idx] = Some(v.clone());
                v
            }
            tag::MATCHER => {
                let m = RegexMatcher::read_state(self)?;
                let v = Value::matcher(m);
                self.slots[idx] = Some(v.clone());
                v
            }
            unknown => {
                let v = self.unknown_tag(unknown)?;
                self.slots[idx] = Some(v.clone());
                v
            }
        };
        Ok(value)
    }

    fn read_array_body(&mut self, idx: usize) -> RunResult<Value> {
        let dims = self.buf.read_u8()?;
        let kind = ArrayKind::from_tag(self.buf.read_u8()?)
            .ok_or_else(|| RuntimeError::msg("Corrupt checkpoint: bad array kind"))?;
        let n = self.read_len()?;
        match kind {
            ArrayKind::Ref => {
                let arr = Arc::new(Mutex::new(TypedArray {
                    kind,
                    dims,
                    data: ArrayData::Ref(vec![Value::Null; n]),
                }));
                self.slots[idx] = Some(Value::Array(arr.clone()));
                for i in 0..n {
                    let v = self.read_value()?;
                    if let ArrayData::Ref(items) = &mut arr.lock().data {
                        items[i] = v;
                    }
                }
                Ok(Value::Array(arr))
            }
            ArrayKind::Bool => {
                let mut items = Vec::with_capacity(n);
                let mut byte = 0u8;
                for i in 0..n {
                    if i % 8 == 0 {
                        byte = self.buf.read_u8()?;
                    }
                    items.push(byte & (1 << (i % 8)) != 0);
                }
                let v = Value::Array(Arc::new(Mutex::new(TypedArray {
                    kind,
                    dims,
                    data: ArrayData::Bool(items),
                })));
                self.slots[idx] = Some(v.clone());
                Ok(v)
            }
            ArrayKind::Int => {
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.buf.read_cint()?);
                }
                let v = Value::Array(Arc::new(Mutex::new(TypedArray {
                    kind,
                    dims,
                    data: ArrayData::Int(items),
                })));
                self.slots[idx] = Some(v.clone());
                Ok(v)
            }
            ArrayKind::Long => {
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.buf.read_clong()?);
                }
                let v = Value::Array(Arc::new(Mutex::new(TypedArray {
                    kind,
                    dims,
                    data: ArrayData::Long(items),
                })));
                self.slots[idx] = Some(v.clone());
                Ok(v)
            }
            ArrayKind::Float => {
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.buf.read_f64_bits()?);
                }
                let v = Value::Array(Arc::new(Mutex::new(TypedArray {
                    kind,
                    dims,
                    data: ArrayData::Float(items),
                })));
                self.slots[idx] = Some(v.clone());
                Ok(v)
            }
        }
    }

    fn read_len(&mut self) -> RunResult<usize> {
        let n = self.buf.read_cint()?;
        if n < 0 {
            return Err(RuntimeError::msg("Corrupt checkpoint: negative length"));
        }
        Ok(n as usize)
    }

    // --- primitive passthroughs for read_state implementations ---

    /// Read one byte
    pub fn read_u8(&mut self) -> RunResult<u8> {
        self.buf.read_u8()
    }

    /// Read a boolean byte
    pub fn read_bool(&mut self) -> RunResult<bool> {
        Ok(self.buf.read_u8()? != 0)
    }

    /// Read a varint i32
    pub fn read_cint(&mut self) -> RunResult<i32> {
        self.buf.read_cint()
    }

    /// Read a varint i64
    pub fn read_clong(&mut self) -> RunResult<i64> {
        self.buf.read_clong()
    }

    /// Read raw f64 bits
    pub fn read_f64(&mut self) -> RunResult<f64> {
        self.buf.read_f64_bits()
    }

    /// Read a length-prefixed string
    pub fn read_str(&mut self) -> RunResult<String> {
        self.buf.read_str()
    }

    /// Read an optional value (presence byte + value)
    pub fn read_opt_value(&mut self) -> RunResult<Option<Value>> {
        if self.buf.read_u8()? == 0 {
            Ok(None)
        } else {
            Ok(Some(self.read_value()?))
        }
    }
}
