//! Binary layout of the decompressed seed artifact.
//!
//! All integers and floats are big-endian. Strings are u16-length-prefixed
//! UTF-8. Layout: magic, version (u16), seed_id, model_source,
//! forecast_start_time_ms (i64), |time_steps| (u32) + i64 each,
//! |lats| (u32) + f32 each, |lons| (u32) + f32 each, |variables| (u16),
//! then per variable: name, encoding tag (u8), and either raw f32 values or
//! `scale (f32), offset (f32)` followed by i16 quantized values. Every
//! variable carries exactly |time_steps|·|lats|·|lons| values.

use std::collections::BTreeMap;
use crate::seed::{Seed, SeedError, Values};

pub(crate) const MAGIC: &[u8; 4] = b"MSED";
pub(crate) const VERSION: u16 = 1;

const ENCODING_RAW: u8 = 0;
const ENCODING_QUANTIZED: u8 = 1;

pub fn decode(buf: &[u8]) -> Result<Seed, SeedError> {
    let mut reader = Reader::new(buf);

    let magic: [u8; 4] = reader.read_array()?;
    if &magic != MAGIC {
        return Err(SeedError::Header(String::from("bad magic")));
    }
    let version: u16 = reader.read()?;
    if version != VERSION {
        return Err(SeedError::Version(version));
    }

    let seed_id = reader.read_string()?;
    let model_source = reader.read_string()?;
    let forecast_start_time_ms: i64 = reader.read()?;

    let num_steps = reader.read::<u32>()? as usize;
    let mut time_steps_ms = Vec::with_capacity(num_steps.min(reader.remaining()));
    for _ in 0..num_steps {
        time_steps_ms.push(reader.read::<i64>()?);
    }

    let num_lats = reader.read::<u32>()? as usize;
    let mut latitudes = Vec::with_capacity(num_lats.min(reader.remaining()));
    for _ in 0..num_lats {
        latitudes.push(reader.read::<f32>()?);
    }

    let num_lons = reader.read::<u32>()? as usize;
    let mut longitudes = Vec::with_capacity(num_lons.min(reader.remaining()));
    for _ in 0..num_lons {
        longitudes.push(reader.read::<f32>()?);
    }

    let count = num_steps * num_lats * num_lons;
    let num_variables = reader.read::<u16>()?;

    let mut variables = BTreeMap::new();
    for _ in 0..num_variables {
        let name = reader.read_string()?;
        let encoding = reader.read::<u8>()?;

        let values = match encoding {
            ENCODING_RAW => {
                let mut values = Vec::with_capacity(count.min(reader.remaining()));
                for _ in 0..count {
                    values.push(reader.read::<f32>()?);
                }
                Values::Raw(values)
            }
            ENCODING_QUANTIZED => {
                let scale: f32 = reader.read()?;
                let offset: f32 = reader.read()?;
                let mut q = Vec::with_capacity(count.min(reader.remaining()));
                for _ in 0..count {
                    q.push(reader.read::<i16>()?);
                }
                Values::Quantized { q, scale, offset }
            }
            tag => {
                return Err(SeedError::UnknownEncoding(tag));
            }
        };

        variables.insert(name, values);
    }

    if reader.remaining() > 0 {
        return Err(SeedError::Shape(format!("{} bytes past the last variable", reader.remaining())));
    }

    Ok(Seed {
        seed_id,
        model_source,
        forecast_start_time_ms,
        time_steps_ms,
        latitudes,
        longitudes,
        variables,
    })
}

pub fn encode(seed: &Seed) -> Vec<u8> {
    let mut writer = Writer::new();

    writer.buf.extend_from_slice(MAGIC);
    writer.write_u16(VERSION);
    writer.write_string(&seed.seed_id);
    writer.write_string(&seed.model_source);
    writer.write_i64(seed.forecast_start_time_ms);

    writer.write_u32(seed.time_steps_ms.len() as u32);
    for step in &seed.time_steps_ms {
        writer.write_i64(*step);
    }
    writer.write_u32(seed.latitudes.len() as u32);
    for lat in &seed.latitudes {
        writer.write_f32(*lat);
    }
    writer.write_u32(seed.longitudes.len() as u32);
    for lon in &seed.longitudes {
        writer.write_f32(*lon);
    }

    writer.write_u16(seed.variables.len() as u16);
    for (name, values) in &seed.variables {
        writer.write_string(name);
        match values {
            Values::Raw(values) => {
                writer.write_u8(ENCODING_RAW);
                for value in values {
                    writer.write_f32(*value);
                }
            }
            Values::Quantized { q, scale, offset } => {
                writer.write_u8(ENCODING_QUANTIZED);
                writer.write_f32(*scale);
                writer.write_f32(*offset);
                for value in q {
                    writer.write_i16(*value);
                }
            }
        }
    }

    writer.buf
}

/// Dequantizes a stream of packed integers, one multiply-add per value.
pub(crate) struct DequantIter<I: Iterator<Item = i16>> {
    inner: I,
    scale: f32,
    offset: f32,
}

impl<I: Iterator<Item = i16>> DequantIter<I> {
    pub(crate) fn new(inner: I, scale: f32, offset: f32) -> Self {
        Self { inner, scale, offset }
    }
}

impl<I: Iterator<Item = i16>> Iterator for DequantIter<I> {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        self.inner.next().map(|q| self.offset + q as f32 * self.scale)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read<T: EndianRead>(&mut self) -> Result<T, SeedError> {
        let end = self.pos + std::mem::size_of::<T>();
        if end > self.buf.len() {
            return Err(SeedError::Truncated());
        }
        let value = T::from_be_bytes(&self.buf[self.pos..end]);
        self.pos = end;

        Ok(value)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], SeedError> {
        let end = self.pos + N;
        if end > self.buf.len() {
            return Err(SeedError::Truncated());
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;

        Ok(out)
    }

    fn read_string(&mut self) -> Result<String, SeedError> {
        let len = self.read::<u16>()? as usize;
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(SeedError::Truncated());
        }
        let value = String::from_utf8(self.buf[self.pos..end].to_vec())
            .map_err(|_| SeedError::Header(String::from("non-utf8 string")))?;
        self.pos = end;

        Ok(value)
    }
}

trait EndianRead: Sized {
    fn from_be_bytes(bytes: &[u8]) -> Self;
}

macro_rules! endian_impl {
    ($ty:ty) => {
        impl EndianRead for $ty {
            fn from_be_bytes(bytes: &[u8]) -> Self {
                <$ty>::from_be_bytes(bytes.try_into().expect("sized slice"))
            }
        }
    };
}

endian_impl! { u8 }
endian_impl! { u16 }
endian_impl! { u32 }
endian_impl! { i16 }
endian_impl! { i64 }
endian_impl! { f32 }

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_string(&mut self, value: &str) {
        self.write_u16(value.len() as u16);
        self.buf.extend_from_slice(value.as_bytes());
    }
}
