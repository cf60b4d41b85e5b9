//! Big-endian field codec for serialized buckets.

use std::io::{self, Read, Write};

use super::{BucketError, FormatError};

fn read_array<const N: usize>(reader: &mut dyn Read, field: &'static str) -> Result<[u8; N], BucketError> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).map_err(|e| eof_as_truncated(e, field))?;
    Ok(buf)
}

fn eof_as_truncated(e: io::Error, field: &'static str) -> BucketError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FormatError::Truncated { field }.into()
    } else {
        BucketError::from(e)
    }
}

pub(crate) fn read_u8(reader: &mut dyn Read, field: &'static str) -> Result<u8, BucketError> {
    Ok(read_array::<1>(reader, field)?[0])
}

pub(crate) fn read_u32(reader: &mut dyn Read, field: &'static str) -> Result<u32, BucketError> {
    Ok(u32::from_be_bytes(read_array(reader, field)?))
}

pub(crate) fn read_u64(reader: &mut dyn Read, field: &'static str) -> Result<u64, BucketError> {
    Ok(u64::from_be_bytes(read_array(reader, field)?))
}

/// A single `0`/`1` byte.
pub(crate) fn read_bool(reader: &mut dyn Read, field: &'static str) -> Result<bool, BucketError> {
    match read_u8(reader, field)? {
        0 => Ok(false),
        1 => Ok(true),
        value => Err(FormatError::InvalidFlag { field, value }.into()),
    }
}

pub(crate) fn read_bytes(
    reader: &mut dyn Read,
    len: usize,
    field: &'static str,
) -> Result<Vec<u8>, BucketError> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).map_err(|e| eof_as_truncated(e, field))?;
    Ok(buf)
}

/// Read a version field and require it to equal `expected`.
pub(crate) fn expect_version(
    reader: &mut dyn Read,
    kind: &'static str,
    expected: u32,
) -> Result<(), BucketError> {
    let actual = read_u32(reader, "version")?;
    if actual == expected {
        Ok(())
    } else {
        Err(FormatError::UnsupportedVersion {
            kind,
            expected,
            actual,
        }
        .into())
    }
}

pub(crate) fn write_u8(out: &mut dyn Write, value: u8) -> Result<(), BucketError> {
    out.write_all(&[value])?;
    Ok(())
}

pub(crate) fn write_u32(out: &mut dyn Write, value: u32) -> Result<(), BucketError> {
    out.write_all(&value.to_be_bytes())?;
    Ok(())
}

pub(crate) fn write_u64(out: &mut dyn Write, value: u64) -> Result<(), BucketError> {
    out.write_all(&value.to_be_bytes())?;
    Ok(())
}

pub(crate) fn write_bool(out: &mut dyn Write, value: bool) -> Result<(), BucketError> {
    write_u8(out, u8::from(value))
}
