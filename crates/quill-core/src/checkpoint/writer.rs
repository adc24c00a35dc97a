//! Checkpoint writer: streams a value graph with identity preservation

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::checkpoint::buffer::{recycle_buffer, take_buffer, ByteBuf};
use crate::checkpoint::{tag, CODEC_VERSION};
use crate::error::{RunResult, RuntimeError};
use crate::object::{ArrayData, TypedArray};
use crate::value::Value;

/// Streams values into a checkpoint image.
///
/// Heap values are assigned an object id on first sight (keyed by their
/// allocation identity) and enqueued; bodies are written breadth-first
/// after the roots, so cyclic graphs terminate and shared objects are
/// written exactly once.
pub struct CheckpointWriter {
    buf: ByteBuf,
    ids: FxHashMap<usize, u32>,
    pending: VecDeque<(u32, Value)>,
    offsets: Vec<i32>,
    count_pos: usize,
    table_pos: usize,
}

impl CheckpointWriter {
    /// Start a checkpoint image (header written immediately)
    pub fn new() -> RunResult<Self> {
        let mut buf = ByteBuf::from_vec(take_buffer());
        buf.write_cint(CODEC_VERSION as i32)?;
        let count_pos = buf.len();
        buf.write_i32_le(0)?; // object count, patched in finish
        let table_pos = buf.len();
        buf.write_i32_le(0)?; // object table offset, patched in finish
        Ok(Self {
            buf,
            ids: FxHashMap::default(),
            pending: VecDeque::new(),
            offsets: Vec::new(),
            count_pos,
            table_pos,
        })
    }

    /// Write a value: inline for small values, an object reference for
    /// everything else
    pub fn write_value(&mut self, v: &Value) -> RunResult<()> {
        match v {
            Value::Null => self.buf.write_u8(tag::NULL),
            Value::Bool(b) => {
                self.buf.write_u8(tag::BOOL)?;
                self.buf.write_u8(*b as u8)
            }
            Value::Int(i) => {
                self.buf.write_u8(tag::INT)?;
                self.buf.write_cint(*i)
            }
            Value::Long(i) => {
                self.buf.write_u8(tag::LONG)?;
                self.buf.write_clong(*i)
            }
            Value::Float(f) => {
                self.buf.write_u8(tag::FLOAT)?;
                self.buf.write_f64_bits(*f)
            }
            Value::Decimal(d) => {
                self.buf.write_u8(tag::DECIMAL)?;
                self.buf.write_str(&d.to_string())
            }
            other => {
                let id = self.object_id(other)?;
                self.buf.write_u8(tag::ANY)?;
                self.buf.write_cint(id as i32)
            }
        }
    }

    fn object_id(&mut self, v: &Value) -> RunResult<u32> {
        let key = v
            .identity_key()
            .ok_or_else(|| RuntimeError::msg("Value has no identity"))?;
        if let Some(id) = self.ids.get(&key) {
            return Ok(*id);
        }
        let id = self.offsets.len() as u32;
        self.ids.insert(key, id);
        self.offsets.push(-1);
        self.pending.push_back((id, v.clone()));
        Ok(id)
    }

    fn write_body(&mut self, v: &Value) -> RunResult<()> {
        match v {
            Value::Str(s) => {
                self.buf.write_u8(tag::STRING)?;
                self.buf.write_str(s)
            }
            Value::List(l) => {
                let items = l.lock().clone();
                self.buf.write_u8(tag::LIST)?;
                self.buf.write_cint(items.len() as i32)?;
                for item in &items {
                    self.write_value(item)?;
                }
                Ok(())
            }
            Value::Map(m) => {
                let entries = m.lock().clone();
                self.buf.write_u8(tag::MAP)?;
                self.buf.write_cint(entries.len() as i32)?;
                for (k, val) in &entries {
                    self.write_value(&Value::str(k.as_str()))?;
                    self.write_value(val)?;
                }
                Ok(())
            }
            Value::Array(a) => {
                let arr = a.lock().clone();
                self.write_array_body(&arr)
            }
            Value::Instance(inst) => {
                let (name, fields) = {
                    let i = inst.lock();
                    (i.shape.name.clone(), i.fields.clone())
                };
                self.buf.write_u8(tag::INSTANCE)?;
                self.buf.write_str(&name)?;
                self.buf.write_cint(fields.len() as i32)?;
                for f in &fields {
                    self.write_value(f)?;
                }
                Ok(())
            }
            Value::Function(f) => {
                self.buf.write_u8(tag::FUNCTION)?;
                self.buf.write_str(&f.name())?;
                f.write_state(self)
            }
            Value::Iterator(it) => {
                self.buf.write_u8(tag::ITERATOR)?;
                self.buf.write_str(it.kind())?;
                it.write_state(self)
            }
            Value::StringBuilder(b) => {
                let contents = b.lock().clone();
                self.buf.write_u8(tag::STRING_BUILDER)?;
                self.buf.write_str(&contents)
            }
            Value::Matcher(m) => {
                self.buf.write_u8(tag::MATCHER)?;
                let state = m.lock().clone();
                state.write_state(self)
            }
            _ => Err(RuntimeError::msg("Value has no object body")),
        }
    }

    fn write_array_body(&mut self, arr: &TypedArray) -> RunResult<()> {
        self.buf.write_u8(tag::ARRAY)?;
        self.buf.write_u8(arr.dims)?;
        self.buf.write_u8(arr.kind.tag())?;
        self.buf.write_cint(arr.len() as i32)?;
        match &arr.data {
            ArrayData::Bool(bits) => {
                // Packed, 8 elements per byte
                let mut byte = 0u8;
                for (i, b) in bits.iter().enumerate() {
                    if *b {
                        byte |= 1 << (i % 8);
                    }
                    if i % 8 == 7 {
                        self.buf.write_u8(byte)?;
                        byte = 0;
                    }
                }
                if bits.len() % 8 != 0 {
                    self.buf.write_u8(byte)?;
                }
                Ok(())
            }
            ArrayData::Int(items) => {
                for i in items {
                    self.buf.write_cint(*i)?;
                }
                Ok(())
            }
            ArrayData::Long(items) => {
                for i in items {
                    self.buf.write_clong(*i)?;
                }
                Ok(())
            }
            ArrayData::Float(items) => {
                for f in items {
                    self.buf.write_f64_bits(*f)?;
                }
                Ok(())
            }
            ArrayData::Ref(items) => {
                for v in items {
                    self.write_value(v)?;
                }
                Ok(())
            }
        }
    }

    /// Drain pending object bodies, write the offset table, patch the
    /// header, and hand back the finished image. The internal buffer goes
    /// back to the per-thread cache.
    pub fn finish(mut self) -> RunResult<Vec<u8>> {
        while let Some((id, v)) = self.pending.pop_front() {
            self.offsets[id as usize] = self.buf.len() as i32;
            self.write_body(&v)?;
        }
        let table_offset = self.buf.len() as i32;
        let offsets = std::mem::take(&mut self.offsets);
        for off in &offsets {
            self.buf.write_i32_le(*off)?;
        }
        self.buf.patch_i32_le(self.count_pos, offsets.len() as i32);
        self.buf.patch_i32_le(self.table_pos, table_offset);

        log::debug!(
            "checkpoint image: {} bytes, {} objects",
            self.buf.len(),
            offsets.len()
        );
        let data = self.buf.into_vec();
        let image = data.clone();
        recycle_buffer(data);
        Ok(image)
    }

    // --- primitive passthroughs for write_state implementations ---

    /// Write one byte
    pub fn write_u8(&mut self, b: u8) -> RunResult<()> {
        self.buf.write_u8(b)
    }

    /// Write a boolean as one byte
    pub fn write_bool(&mut self, b: bool) -> RunResult<()> {
        self.buf.write_u8(b as u8)
    }

    /// Write a varint i32
    pub fn write_cint(&mut self, v: i32) -> RunResult<()> {
        self.buf.write_cint(v)
    }

    /// Write a varint i64
    pub fn write_clong(&mut self, v: i64) -> RunResult<()> {
        self.buf.write_clong(v)
    }

    /// Write raw f64 bits
    pub fn write_f64(&mut self, v: f64) -> RunResult<()> {
        self.buf.write_f64_bits(v)
    }

    /// Write a length-prefixed string
    pub fn write_str(&mut self, s: &str) -> RunResult<()> {
        self.buf.write_str(s)
    }

    /// Write an optional value (presence byte + value)
    pub fn write_opt_value(&mut self, v: Option<&Value>) -> RunResult<()> {
        match v {
            Some(v) => {
                self.buf.write_u8(1)?;
                self.write_value(v)
            }
            None => self.buf.write_u8(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let w = CheckpointWriter::new().unwrap();
        let image = w.finish().unwrap();
        let mut r = crate::checkpoint::ByteReader::new(&image);
        assert_eq!(r.read_cint().unwrap(), CODEC_VERSION as i32);
        assert_eq!(r.read_i32_le().unwrap(), 0); // no objects
        let table_offset = r.read_i32_le().unwrap() as usize;
        assert_eq!(table_offset, image.len()); // empty table at the end
    }

    #[test]
    fn test_shared_object_written_once() {
        let shared = Value::list(vec![Value::Int(1)]);
        let outer = Value::list(vec![shared.clone(), shared.clone()]);

        let mut w = CheckpointWriter::new().unwrap();
        w.write_value(&outer).unwrap();
        let image = w.finish().unwrap();

        let mut r = crate::checkpoint::ByteReader::new(&image);
        r.read_cint().unwrap();
        let count = r.read_i32_le().unwrap();
        // outer list + inner list: exactly two object bodies
        assert_eq!(count, 2);
    }

    #[test]
    fn test_cyclic_graph_terminates() {
        let v = Value::list(vec![Value::Int(1)]);
        if let Value::List(l) = &v {
            l.lock().push(v.clone());
        }
        let mut w = CheckpointWriter::new().unwrap();
        w.write_value(&v).unwrap();
        let image = w.finish().unwrap();
        assert!(!image.is_empty());
    }
}
