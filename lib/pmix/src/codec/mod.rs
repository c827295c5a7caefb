//! Self-describing pack/unpack of the wire data model.
//!
//! Every `pack` call frames its payload as `(count-tag, count, items...)`;
//! in fully-described buffers each item is additionally preceded by its own
//! type tag so a receiver can verify heterogeneous streams. Multi-byte
//! integers are big-endian on the wire; floats travel as their printed
//! decimal form.

pub mod buffer;

pub use self::buffer::{BufKind, Buffer};

use crate::status::{PmixResult, Status};
use crate::types::{
    App, ByteObject, DataType, Info, Int, Kval, ModexData, Pid, Range, Size, Time, Timeval, Uint,
    Value,
};

/// A type that can be framed onto the wire with a self-describing tag.
pub trait WireType: Sized {
    const TAG: DataType;

    /// Writes the body of one item, without the tag.
    fn emit(&self, buf: &mut Buffer) -> PmixResult<()>;

    /// Reads the body of one item, without the tag.
    fn parse(buf: &mut Buffer) -> PmixResult<Self>;
}

#[inline]
fn store_tag(buf: &mut Buffer, tag: DataType) {
    buf.put_u8(tag.into());
}

#[inline]
fn read_tag(buf: &mut Buffer) -> PmixResult<DataType> {
    DataType::from_u8(buf.get_u8()?)
}

/// Packs `vals` onto the buffer: count (tagged int32 in fully-described
/// mode) followed by each item, tag-prefixed when the buffer is described.
pub fn pack<T: WireType>(buf: &mut Buffer, vals: &[T]) -> PmixResult<()> {
    if vals.len() > i32::max_value() as usize {
        return Err(Status::BadParam);
    }
    if buf.kind() == BufKind::FullyDesc {
        store_tag(buf, DataType::Int32);
    }
    buf.put_i32(vals.len() as i32);
    for val in vals {
        if buf.kind() == BufKind::FullyDesc {
            store_tag(buf, T::TAG);
        }
        val.emit(buf)?;
    }
    Ok(())
}

/// Unpacks up to `max_vals` items into `dest`. When the encoded count
/// exceeds the caller's maximum, the prefix that fits is delivered and
/// `UnpackInadequateSpace` is returned; the cursor stops after the last
/// delivered item. A tag mismatch leaves the cursor before the offending
/// tag.
pub fn unpack<T: WireType>(buf: &mut Buffer, dest: &mut Vec<T>, max_vals: i32) -> PmixResult<()> {
    if buf.kind() == BufKind::FullyDesc {
        let outer = read_tag(buf)?;
        if outer != DataType::Int32 {
            return Err(Status::UnpackFailure);
        }
    }
    let count = buf.get_i32()?;
    if count < 0 || max_vals < 0 {
        return Err(Status::UnpackFailure);
    }
    let deliver = std::cmp::min(count, max_vals);
    for _ in 0..deliver {
        if buf.kind() == BufKind::FullyDesc {
            let tag = DataType::from_u8(buf.peek_u8()?)?;
            if tag != T::TAG {
                return Err(Status::PackMismatch);
            }
            buf.skip(1)?;
        }
        dest.push(T::parse(buf)?);
    }
    if count > max_vals {
        return Err(Status::UnpackInadequateSpace);
    }
    Ok(())
}

/// Unpacks a pack-call worth of items, however many were encoded.
pub fn unpack_all<T: WireType>(buf: &mut Buffer) -> PmixResult<Vec<T>> {
    let mut out = Vec::new();
    unpack(buf, &mut out, i32::max_value())?;
    Ok(out)
}

/// Unpacks exactly one item.
pub fn unpack_one<T: WireType>(buf: &mut Buffer) -> PmixResult<T> {
    let mut out = Vec::with_capacity(1);
    unpack(buf, &mut out, 1)?;
    out.into_iter().next().ok_or(Status::UnpackFailure)
}

// ---------------------------------------------------------------------------
// Body encodings shared between standalone packs and value variants.
// ---------------------------------------------------------------------------

/// Strings are length-prefixed with an int32 that includes the terminating
/// NUL; a NULL string packs as length zero with no payload.
fn emit_string(buf: &mut Buffer, val: Option<&str>) -> PmixResult<()> {
    match val {
        None => buf.put_i32(0),
        Some(s) => {
            let len = s.len() + 1;
            if len > i32::max_value() as usize {
                return Err(Status::BadParam);
            }
            buf.put_i32(len as i32);
            buf.put_bytes(s.as_bytes());
            buf.put_u8(0);
        }
    }
    Ok(())
}

fn parse_string(buf: &mut Buffer) -> PmixResult<Option<String>> {
    let len = buf.get_i32()?;
    if len < 0 {
        return Err(Status::UnpackFailure);
    }
    if len == 0 {
        return Ok(None);
    }
    let raw = buf.get_bytes(len as usize)?;
    if raw[raw.len() - 1] != 0 {
        return Err(Status::UnpackFailure);
    }
    String::from_utf8(raw[..raw.len() - 1].to_vec())
        .map(Some)
        .map_err(|_| Status::UnpackFailure)
}

fn parse_owned_string(buf: &mut Buffer) -> PmixResult<String> {
    Ok(parse_string(buf)?.unwrap_or_default())
}

fn emit_byte_object(buf: &mut Buffer, val: &ByteObject) -> PmixResult<()> {
    if val.bytes.len() > i32::max_value() as usize {
        return Err(Status::BadParam);
    }
    buf.put_i32(val.bytes.len() as i32);
    buf.put_bytes(&val.bytes);
    Ok(())
}

fn parse_byte_object(buf: &mut Buffer) -> PmixResult<ByteObject> {
    let size = buf.get_i32()?;
    if size < 0 {
        return Err(Status::UnpackFailure);
    }
    Ok(ByteObject::new(buf.get_bytes(size as usize)?.to_vec()))
}

/// Floats travel as printed decimal strings, sidestepping cross-host binary
/// float layout.
fn emit_float(buf: &mut Buffer, val: f32) -> PmixResult<()> {
    emit_string(buf, Some(format!("{}", val).as_str()))
}

fn parse_float(buf: &mut Buffer) -> PmixResult<f32> {
    let text = parse_string(buf)?.ok_or(Status::UnpackFailure)?;
    text.parse::<f32>().map_err(|_| Status::UnpackFailure)
}

fn emit_double(buf: &mut Buffer, val: f64) -> PmixResult<()> {
    emit_string(buf, Some(format!("{}", val).as_str()))
}

fn parse_double(buf: &mut Buffer) -> PmixResult<f64> {
    let text = parse_string(buf)?.ok_or(Status::UnpackFailure)?;
    text.parse::<f64>().map_err(|_| Status::UnpackFailure)
}

fn emit_array<T>(
    buf: &mut Buffer,
    items: &[T],
    mut emit_item: impl FnMut(&mut Buffer, &T) -> PmixResult<()>,
) -> PmixResult<()> {
    if items.len() > i32::max_value() as usize {
        return Err(Status::BadParam);
    }
    buf.put_i32(items.len() as i32);
    for item in items {
        emit_item(buf, item)?;
    }
    Ok(())
}

fn parse_array<T>(
    buf: &mut Buffer,
    mut parse_item: impl FnMut(&mut Buffer) -> PmixResult<T>,
) -> PmixResult<Vec<T>> {
    let size = buf.get_i32()?;
    if size < 0 {
        return Err(Status::UnpackFailure);
    }
    let mut out = Vec::with_capacity(std::cmp::min(size as usize, 4096));
    for _ in 0..size {
        out.push(parse_item(buf)?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Primitive impls
// ---------------------------------------------------------------------------

macro_rules! scalar_wire_type {
    ($ty:ty, $tag:expr, $put:ident, $get:ident) => {
        impl WireType for $ty {
            const TAG: DataType = $tag;

            #[inline]
            fn emit(&self, buf: &mut Buffer) -> PmixResult<()> {
                buf.$put(*self);
                Ok(())
            }

            #[inline]
            fn parse(buf: &mut Buffer) -> PmixResult<Self> {
                buf.$get()
            }
        }
    };
}

scalar_wire_type!(u8, DataType::Byte, put_u8, get_u8);
scalar_wire_type!(i8, DataType::Int8, put_i8, get_i8);
scalar_wire_type!(i16, DataType::Int16, put_i16, get_i16);
scalar_wire_type!(i32, DataType::Int32, put_i32, get_i32);
scalar_wire_type!(i64, DataType::Int64, put_i64, get_i64);
scalar_wire_type!(u16, DataType::Uint16, put_u16, get_u16);
scalar_wire_type!(u32, DataType::Uint32, put_u32, get_u32);
scalar_wire_type!(u64, DataType::Uint64, put_u64, get_u64);

impl WireType for bool {
    const TAG: DataType = DataType::Bool;

    #[inline]
    fn emit(&self, buf: &mut Buffer) -> PmixResult<()> {
        buf.put_u8(*self as u8);
        Ok(())
    }

    #[inline]
    fn parse(buf: &mut Buffer) -> PmixResult<Self> {
        Ok(buf.get_u8()? != 0)
    }
}

macro_rules! newtype_wire_type {
    ($ty:ident, $tag:expr, $put:ident, $get:ident) => {
        impl WireType for $ty {
            const TAG: DataType = $tag;

            #[inline]
            fn emit(&self, buf: &mut Buffer) -> PmixResult<()> {
                buf.$put(self.0);
                Ok(())
            }

            #[inline]
            fn parse(buf: &mut Buffer) -> PmixResult<Self> {
                Ok($ty(buf.$get()?))
            }
        }
    };
}

newtype_wire_type!(Size, DataType::Size, put_u64, get_u64);
newtype_wire_type!(Pid, DataType::Pid, put_u32, get_u32);
newtype_wire_type!(Time, DataType::Time, put_u64, get_u64);
newtype_wire_type!(Int, DataType::Int, put_i32, get_i32);
newtype_wire_type!(Uint, DataType::Uint, put_u32, get_u32);

impl WireType for f32 {
    const TAG: DataType = DataType::Float;

    fn emit(&self, buf: &mut Buffer) -> PmixResult<()> {
        emit_float(buf, *self)
    }

    fn parse(buf: &mut Buffer) -> PmixResult<Self> {
        parse_float(buf)
    }
}

impl WireType for f64 {
    const TAG: DataType = DataType::Double;

    fn emit(&self, buf: &mut Buffer) -> PmixResult<()> {
        emit_double(buf, *self)
    }

    fn parse(buf: &mut Buffer) -> PmixResult<Self> {
        parse_double(buf)
    }
}

impl WireType for Timeval {
    const TAG: DataType = DataType::Timeval;

    fn emit(&self, buf: &mut Buffer) -> PmixResult<()> {
        buf.put_i64(self.sec);
        buf.put_i64(self.usec);
        Ok(())
    }

    fn parse(buf: &mut Buffer) -> PmixResult<Self> {
        Ok(Timeval {
            sec: buf.get_i64()?,
            usec: buf.get_i64()?,
        })
    }
}

/// Strings pack through `Option` so a NULL source and an empty string stay
/// distinguishable across the wire.
impl WireType for Option<String> {
    const TAG: DataType = DataType::String;

    fn emit(&self, buf: &mut Buffer) -> PmixResult<()> {
        emit_string(buf, self.as_ref().map(String::as_str))
    }

    fn parse(buf: &mut Buffer) -> PmixResult<Self> {
        parse_string(buf)
    }
}

impl WireType for ByteObject {
    const TAG: DataType = DataType::ByteObject;

    fn emit(&self, buf: &mut Buffer) -> PmixResult<()> {
        emit_byte_object(buf, self)
    }

    fn parse(buf: &mut Buffer) -> PmixResult<Self> {
        parse_byte_object(buf)
    }
}

/// Nesting a buffer records its mode and used byte count, then the raw
/// bytes; the child unpacks as a self-contained buffer.
impl WireType for Buffer {
    const TAG: DataType = DataType::Buffer;

    fn emit(&self, buf: &mut Buffer) -> PmixResult<()> {
        buf.put_u8(self.kind() as u8);
        buf.put_u64(self.used() as u64);
        buf.put_bytes(self.as_slice());
        Ok(())
    }

    fn parse(buf: &mut Buffer) -> PmixResult<Self> {
        let kind = BufKind::from_u8(buf.get_u8()?)?;
        let used = buf.get_u64()?;
        if used > usize::max_value() as u64 {
            return Err(Status::UnpackFailure);
        }
        let raw = buf.get_bytes(used as usize)?.to_vec();
        Ok(Buffer::from_vec(kind, raw))
    }
}

// ---------------------------------------------------------------------------
// Compound impls
// ---------------------------------------------------------------------------

impl WireType for Value {
    const TAG: DataType = DataType::Value;

    /// A value packs as its int type-tag followed by the active variant's
    /// body.
    fn emit(&self, buf: &mut Buffer) -> PmixResult<()> {
        buf.put_i32(u8::from(self.tag()) as i32);
        match self {
            Value::Bool(v) => v.emit(buf),
            Value::Byte(v) => v.emit(buf),
            Value::String(v) => emit_string(buf, Some(v.as_str())),
            Value::Size(v) => Size(*v).emit(buf),
            Value::Pid(v) => Pid(*v).emit(buf),
            Value::Int(v) => Int(*v).emit(buf),
            Value::Int8(v) => v.emit(buf),
            Value::Int16(v) => v.emit(buf),
            Value::Int32(v) => v.emit(buf),
            Value::Int64(v) => v.emit(buf),
            Value::Uint(v) => Uint(*v).emit(buf),
            Value::Uint8(v) => v.emit(buf),
            Value::Uint16(v) => v.emit(buf),
            Value::Uint32(v) => v.emit(buf),
            Value::Uint64(v) => v.emit(buf),
            Value::Float(v) => emit_float(buf, *v),
            Value::Double(v) => emit_double(buf, *v),
            Value::Timeval(v) => v.emit(buf),
            Value::Time(v) => Time(*v).emit(buf),
            Value::ByteObject(v) => emit_byte_object(buf, v),
            Value::BoolArray(v) => emit_array(buf, v, |b, it| it.emit(b)),
            Value::ByteArray(v) => emit_array(buf, v, |b, it| it.emit(b)),
            Value::StringArray(v) => emit_array(buf, v, |b, it| emit_string(b, Some(it.as_str()))),
            Value::SizeArray(v) => emit_array(buf, v, |b, it| Size(*it).emit(b)),
            Value::PidArray(v) => emit_array(buf, v, |b, it| Pid(*it).emit(b)),
            Value::IntArray(v) => emit_array(buf, v, |b, it| Int(*it).emit(b)),
            Value::Int8Array(v) => emit_array(buf, v, |b, it| it.emit(b)),
            Value::Int16Array(v) => emit_array(buf, v, |b, it| it.emit(b)),
            Value::Int32Array(v) => emit_array(buf, v, |b, it| it.emit(b)),
            Value::Int64Array(v) => emit_array(buf, v, |b, it| it.emit(b)),
            Value::UintArray(v) => emit_array(buf, v, |b, it| Uint(*it).emit(b)),
            Value::Uint8Array(v) => emit_array(buf, v, |b, it| it.emit(b)),
            Value::Uint16Array(v) => emit_array(buf, v, |b, it| it.emit(b)),
            Value::Uint32Array(v) => emit_array(buf, v, |b, it| it.emit(b)),
            Value::Uint64Array(v) => emit_array(buf, v, |b, it| it.emit(b)),
            Value::FloatArray(v) => emit_array(buf, v, |b, it| emit_float(b, *it)),
            Value::DoubleArray(v) => emit_array(buf, v, |b, it| emit_double(b, *it)),
            Value::TimevalArray(v) => emit_array(buf, v, |b, it| it.emit(b)),
            Value::ByteObjectArray(v) => emit_array(buf, v, |b, it| emit_byte_object(b, it)),
            Value::InfoArray(v) => emit_array(buf, v, |b, it| it.emit(b)),
        }
    }

    fn parse(buf: &mut Buffer) -> PmixResult<Self> {
        let raw = buf.get_i32()?;
        if raw < 0 || raw > u8::max_value() as i32 {
            return Err(Status::UnknownDataType);
        }
        let tag = DataType::from_u8(raw as u8)?;
        Ok(match tag {
            DataType::Bool => Value::Bool(bool::parse(buf)?),
            DataType::Byte => Value::Byte(u8::parse(buf)?),
            DataType::String => Value::String(parse_owned_string(buf)?),
            DataType::Size => Value::Size(Size::parse(buf)?.0),
            DataType::Pid => Value::Pid(Pid::parse(buf)?.0),
            DataType::Int => Value::Int(Int::parse(buf)?.0),
            DataType::Int8 => Value::Int8(i8::parse(buf)?),
            DataType::Int16 => Value::Int16(i16::parse(buf)?),
            DataType::Int32 => Value::Int32(i32::parse(buf)?),
            DataType::Int64 => Value::Int64(i64::parse(buf)?),
            DataType::Uint => Value::Uint(Uint::parse(buf)?.0),
            DataType::Uint8 => Value::Uint8(u8::parse(buf)?),
            DataType::Uint16 => Value::Uint16(u16::parse(buf)?),
            DataType::Uint32 => Value::Uint32(u32::parse(buf)?),
            DataType::Uint64 => Value::Uint64(u64::parse(buf)?),
            DataType::Float => Value::Float(parse_float(buf)?),
            DataType::Double => Value::Double(parse_double(buf)?),
            DataType::Timeval => Value::Timeval(Timeval::parse(buf)?),
            DataType::Time => Value::Time(Time::parse(buf)?.0),
            DataType::ByteObject => Value::ByteObject(parse_byte_object(buf)?),
            DataType::BoolArray => Value::BoolArray(parse_array(buf, bool::parse)?),
            DataType::ByteArray => Value::ByteArray(parse_array(buf, u8::parse)?),
            DataType::StringArray => Value::StringArray(parse_array(buf, parse_owned_string)?),
            DataType::SizeArray => {
                Value::SizeArray(parse_array(buf, |b| Size::parse(b).map(|v| v.0))?)
            }
            DataType::PidArray => Value::PidArray(parse_array(buf, |b| Pid::parse(b).map(|v| v.0))?),
            DataType::IntArray => Value::IntArray(parse_array(buf, |b| Int::parse(b).map(|v| v.0))?),
            DataType::Int8Array => Value::Int8Array(parse_array(buf, i8::parse)?),
            DataType::Int16Array => Value::Int16Array(parse_array(buf, i16::parse)?),
            DataType::Int32Array => Value::Int32Array(parse_array(buf, i32::parse)?),
            DataType::Int64Array => Value::Int64Array(parse_array(buf, i64::parse)?),
            DataType::UintArray => {
                Value::UintArray(parse_array(buf, |b| Uint::parse(b).map(|v| v.0))?)
            }
            DataType::Uint8Array => Value::Uint8Array(parse_array(buf, u8::parse)?),
            DataType::Uint16Array => Value::Uint16Array(parse_array(buf, u16::parse)?),
            DataType::Uint32Array => Value::Uint32Array(parse_array(buf, u32::parse)?),
            DataType::Uint64Array => Value::Uint64Array(parse_array(buf, u64::parse)?),
            DataType::FloatArray => Value::FloatArray(parse_array(buf, parse_float)?),
            DataType::DoubleArray => Value::DoubleArray(parse_array(buf, parse_double)?),
            DataType::TimevalArray => Value::TimevalArray(parse_array(buf, Timeval::parse)?),
            DataType::ByteObjectArray => {
                Value::ByteObjectArray(parse_array(buf, parse_byte_object)?)
            }
            DataType::InfoArray => Value::InfoArray(parse_array(buf, Info::parse)?),
            _ => return Err(Status::UnknownDataType),
        })
    }
}

/// A key/value pair packs as the key string followed by the tagged value.
impl WireType for Kval {
    const TAG: DataType = DataType::Kval;

    fn emit(&self, buf: &mut Buffer) -> PmixResult<()> {
        emit_string(buf, Some(self.key.as_str()))?;
        self.value.emit(buf)
    }

    fn parse(buf: &mut Buffer) -> PmixResult<Self> {
        let key = parse_string(buf)?.ok_or(Status::UnpackFailure)?;
        let value = Value::parse(buf)?;
        Ok(Kval { key, value })
    }
}

impl WireType for Info {
    const TAG: DataType = DataType::Info;

    fn emit(&self, buf: &mut Buffer) -> PmixResult<()> {
        emit_string(buf, Some(self.key.as_str()))?;
        self.value.emit(buf)
    }

    fn parse(buf: &mut Buffer) -> PmixResult<Self> {
        let key = parse_string(buf)?.ok_or(Status::UnpackFailure)?;
        let value = Value::parse(buf)?;
        Ok(Info { key, value })
    }
}

impl WireType for ModexData {
    const TAG: DataType = DataType::Modex;

    fn emit(&self, buf: &mut Buffer) -> PmixResult<()> {
        emit_string(buf, Some(self.nspace.as_str()))?;
        buf.put_i32(self.rank);
        emit_byte_object(buf, &ByteObject::new(self.blob.clone()))
    }

    fn parse(buf: &mut Buffer) -> PmixResult<Self> {
        let nspace = parse_string(buf)?.ok_or(Status::UnpackFailure)?;
        let rank = buf.get_i32()?;
        let blob = parse_byte_object(buf)?.bytes;
        Ok(ModexData { nspace, rank, blob })
    }
}

impl WireType for Range {
    const TAG: DataType = DataType::Range;

    fn emit(&self, buf: &mut Buffer) -> PmixResult<()> {
        emit_string(buf, Some(self.nspace.as_str()))?;
        emit_array(buf, &self.ranks, |b, it| it.emit(b))
    }

    fn parse(buf: &mut Buffer) -> PmixResult<Self> {
        let nspace = parse_string(buf)?.ok_or(Status::UnpackFailure)?;
        let ranks = parse_array(buf, i32::parse)?;
        Ok(Range { nspace, ranks })
    }
}

impl WireType for App {
    const TAG: DataType = DataType::App;

    fn emit(&self, buf: &mut Buffer) -> PmixResult<()> {
        emit_string(buf, Some(self.cmd.as_str()))?;
        emit_array(buf, &self.argv, |b, it| emit_string(b, Some(it.as_str())))?;
        emit_array(buf, &self.env, |b, it| emit_string(b, Some(it.as_str())))?;
        buf.put_i32(self.maxprocs);
        Ok(())
    }

    fn parse(buf: &mut Buffer) -> PmixResult<Self> {
        let cmd = parse_string(buf)?.ok_or(Status::UnpackFailure)?;
        let argv = parse_array(buf, parse_owned_string)?;
        let env = parse_array(buf, parse_owned_string)?;
        let maxprocs = buf.get_i32()?;
        Ok(App {
            cmd,
            argv,
            env,
            maxprocs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: WireType + Clone + PartialEq + std::fmt::Debug>(vals: &[T]) {
        for kind in &[BufKind::FullyDesc, BufKind::NonDesc] {
            let mut buf = Buffer::new(*kind);
            pack(&mut buf, vals).unwrap();
            let back: Vec<T> = unpack_all(&mut buf).unwrap();
            assert_eq!(&back[..], vals);
            assert!(buf.is_exhausted());
        }
    }

    #[test]
    fn test_primitive_roundtrips() {
        roundtrip(&[true, false, true]);
        roundtrip(&[0u8, 1, 255]);
        roundtrip(&[-128i8, 0, 127]);
        roundtrip(&[i16::min_value(), -1, 0, i16::max_value()]);
        roundtrip(&[i32::min_value(), -1, 0, i32::max_value()]);
        roundtrip(&[i64::min_value(), -1, 0, i64::max_value()]);
        roundtrip(&[0u16, u16::max_value()]);
        roundtrip(&[0u32, u32::max_value()]);
        roundtrip(&[0u64, u64::max_value()]);
        roundtrip(&[Size(0), Size(u64::max_value())]);
        roundtrip(&[Pid(1), Pid(65000)]);
        roundtrip(&[Time(1_400_000_000)]);
        roundtrip(&[Int(-12), Int(12340)]);
        roundtrip(&[Uint(0), Uint(99)]);
    }

    #[test]
    fn test_float_roundtrips() {
        roundtrip(&[12.15f32, -0.5, 0.0, 3.402_823_5e38]);
        roundtrip(&[12.15f64, -1e300, 0.000_001]);
    }

    #[test]
    fn test_timeval_roundtrip() {
        roundtrip(&[
            Timeval { sec: 0, usec: 0 },
            Timeval {
                sec: 1_400_000_000,
                usec: 999_999,
            },
            Timeval { sec: -1, usec: 1 },
        ]);
    }

    #[test]
    fn test_string_null_vs_empty() {
        let vals = vec![Some("hello".to_string()), None, Some(String::new())];
        let mut buf = Buffer::fully_desc();
        pack(&mut buf, &vals).unwrap();
        let back: Vec<Option<String>> = unpack_all(&mut buf).unwrap();
        assert_eq!(back, vals);
    }

    #[test]
    fn test_byte_object_roundtrip() {
        roundtrip(&[
            ByteObject::new(vec![1, 2, 3]),
            ByteObject::new(Vec::new()),
            ByteObject::new(vec![0; 1000]),
        ]);
    }

    #[test]
    fn test_tag_mismatch_does_not_advance() {
        let mut buf = Buffer::fully_desc();
        pack(&mut buf, &[42i32]).unwrap();

        let mut dest: Vec<i16> = Vec::new();
        assert_eq!(
            unpack(&mut buf, &mut dest, 1),
            Err(Status::PackMismatch)
        );
        assert!(dest.is_empty());

        // The offending item tag is still in place: the correct type can
        // resume where the mismatch stopped.
        let tag = DataType::from_u8(buf.peek_u8().unwrap()).unwrap();
        assert_eq!(tag, DataType::Int32);
        buf.skip(1).unwrap();
        assert_eq!(buf.get_i32().unwrap(), 42);
    }

    #[test]
    fn test_non_desc_has_no_tags() {
        let mut desc = Buffer::fully_desc();
        let mut raw = Buffer::non_desc();
        pack(&mut desc, &[7u32]).unwrap();
        pack(&mut raw, &[7u32]).unwrap();
        // tag(count) + count + tag(item) + item vs count + item
        assert_eq!(desc.used(), 1 + 4 + 1 + 4);
        assert_eq!(raw.used(), 4 + 4);
    }

    #[test]
    fn test_inadequate_space_delivers_prefix() {
        let mut buf = Buffer::fully_desc();
        pack(&mut buf, &[1i32, 2, 3, 4]).unwrap();

        let mut dest: Vec<i32> = Vec::new();
        assert_eq!(
            unpack(&mut buf, &mut dest, 2),
            Err(Status::UnpackInadequateSpace)
        );
        assert_eq!(dest, vec![1, 2]);
    }

    #[test]
    fn test_outer_tag_enforced() {
        let mut buf = Buffer::fully_desc();
        // Hand-craft a frame whose count tag is wrong.
        buf.put_u8(DataType::Int16.into());
        buf.put_i32(1);
        let mut dest: Vec<i32> = Vec::new();
        assert_eq!(unpack(&mut buf, &mut dest, 1), Err(Status::UnpackFailure));
    }

    #[test]
    fn test_zero_count_pack() {
        let mut buf = Buffer::fully_desc();
        let empty: [i32; 0] = [];
        pack(&mut buf, &empty).unwrap();
        let back: Vec<i32> = unpack_all(&mut buf).unwrap();
        assert!(back.is_empty());
        assert!(buf.is_exhausted());
    }

    #[test]
    fn test_value_roundtrip_every_variant() {
        let vals = vec![
            Value::Bool(true),
            Value::Byte(7),
            Value::String("Test string #2".into()),
            Value::Size(1 << 40),
            Value::Pid(4242),
            Value::Int(-9),
            Value::Int8(-8),
            Value::Int16(-16),
            Value::Int32(-32),
            Value::Int64(-64),
            Value::Uint(9),
            Value::Uint8(8),
            Value::Uint16(16),
            Value::Uint32(32),
            Value::Uint64(64),
            Value::Float(12.15),
            Value::Double(13.25),
            Value::Timeval(Timeval {
                sec: 100,
                usec: 200,
            }),
            Value::Time(1_500_000_000),
            Value::ByteObject(ByteObject::new(vec![9, 8, 7])),
            Value::BoolArray(vec![true, false]),
            Value::ByteArray(vec![1, 2, 3]),
            Value::StringArray(vec!["a".into(), String::new()]),
            Value::SizeArray(vec![1, 2]),
            Value::PidArray(vec![10, 20]),
            Value::IntArray(vec![-1, 1]),
            Value::Int8Array(vec![-1, 1]),
            Value::Int16Array(vec![-1, 1]),
            Value::Int32Array(vec![-1, 1]),
            Value::Int64Array(vec![-1, 1]),
            Value::UintArray(vec![1, 2]),
            Value::Uint8Array(vec![1, 2]),
            Value::Uint16Array(vec![1, 2]),
            Value::Uint32Array(vec![1, 2]),
            Value::Uint64Array(vec![1, 2]),
            Value::FloatArray(vec![1.5, -2.5]),
            Value::DoubleArray(vec![1.5, -2.5]),
            Value::TimevalArray(vec![Timeval { sec: 1, usec: 2 }]),
            Value::ByteObjectArray(vec![ByteObject::new(vec![1]), ByteObject::default()]),
            Value::InfoArray(vec![Info::new("pmix.rank", Value::Int(3))]),
        ];
        roundtrip(&vals);
    }

    #[test]
    fn test_kval_roundtrip() {
        roundtrip(&[
            Kval::new("local-key-0", Value::Int(12340)),
            Kval::new("remote-key-1", Value::String("Test string #1".into())),
            Kval::new("global-key-2", Value::Float(14.15)),
        ]);
    }

    #[test]
    fn test_nested_buffer_roundtrip() {
        let mut child = Buffer::fully_desc();
        pack(&mut child, &[Kval::new("k", Value::Int(1))]).unwrap();
        let child_used = child.used();

        let mut parent = Buffer::fully_desc();
        pack(&mut parent, &[child]).unwrap();

        let mut back: Buffer = unpack_one(&mut parent).unwrap();
        assert_eq!(back.kind(), BufKind::FullyDesc);
        assert_eq!(back.used(), child_used);
        let kvals: Vec<Kval> = unpack_all(&mut back).unwrap();
        assert_eq!(kvals, vec![Kval::new("k", Value::Int(1))]);
    }

    #[test]
    fn test_modex_range_app_roundtrip() {
        roundtrip(&[ModexData {
            nspace: "job-1".into(),
            rank: 2,
            blob: vec![1, 2, 3],
        }]);
        roundtrip(&[
            Range::all("job-1"),
            Range::ranks("job-2", vec![0, 1, 3]),
        ]);
        roundtrip(&[App {
            cmd: "/bin/worker".into(),
            argv: vec!["worker".into(), "-v".into()],
            env: vec!["X=1".into()],
            maxprocs: 4,
        }]);
    }

    #[test]
    fn test_randomized_scalar_roundtrips() {
        use rand::prelude::*;
        let mut rng = thread_rng();

        let vals: Vec<i64> = (0..512).map(|_| rng.gen()).collect();
        roundtrip(&vals);
        let vals: Vec<u16> = (0..512).map(|_| rng.gen()).collect();
        roundtrip(&vals);
        let vals: Vec<f64> = (0..128).map(|_| rng.gen::<f64>() * 1e12).collect();
        roundtrip(&vals);
    }

    #[test]
    fn test_truncated_stream() {
        let mut buf = Buffer::fully_desc();
        pack(&mut buf, &[123456u64]).unwrap();
        let full = buf.as_slice().to_vec();
        let mut short = Buffer::from_vec(BufKind::FullyDesc, full[..full.len() - 2].to_vec());
        let mut dest: Vec<u64> = Vec::new();
        assert_eq!(
            unpack(&mut short, &mut dest, 1),
            Err(Status::UnpackReadPastEnd)
        );
    }
}
