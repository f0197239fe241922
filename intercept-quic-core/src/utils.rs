use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};
use std::time::Instant;

pub(crate) const QUIC_VARINT_MAX: u64 = (1 << 62) - 1;

// https://www.rfc-editor.org/rfc/rfc9000.html#name-variable-length-integer-enc
// The two most significant bits of the first byte carry the base-2 logarithm of the length
pub(crate) fn decode_variable_length<R>(cursor: &mut R) -> Result<u64>
where
    R: Read,
{
    let first_byte = cursor.read_u8()?;
    let length = 1usize << (first_byte >> 6);
    let mut value = (first_byte & 0x3f) as u64;

    for _ in 1..length {
        value = (value << 8) | cursor.read_u8()? as u64;
    }

    Ok(value)
}

pub(crate) fn get_variable_length(value: u64) -> Result<u8> {
    match value {
        0..=0x3f => Ok(1),
        0x40..=0x3fff => Ok(2),
        0x4000..=0x3fff_ffff => Ok(4),
        0x4000_0000..=QUIC_VARINT_MAX => Ok(8),
        _ => Err(anyhow!("Value {} can not be encoded as a varint", value)),
    }
}

pub(crate) fn encode_variable_length<W>(cursor: &mut W, value: u64) -> Result<u8>
where
    W: Write,
{
    let size = get_variable_length(value)?;
    match size {
        1 => cursor.write_u8(value as u8)?,
        2 => cursor.write_u16::<BigEndian>(0x4000 | value as u16)?,
        4 => cursor.write_u32::<BigEndian>(0x8000_0000 | value as u32)?,
        _ => cursor.write_u64::<BigEndian>(0xc000_0000_0000_0000 | value)?,
    }

    Ok(size)
}

// The long header Length field is written once the payload size is known, always on two bytes
pub(crate) fn encode_variable_length_force_two_bytes<W>(cursor: &mut W, value: u64) -> Result<u8>
where
    W: Write,
{
    if value > 0x3fff {
        return Err(anyhow!("Can not encode {} within two bytes", value));
    }

    cursor.write_u16::<BigEndian>(0x4000 | value as u16)?;
    Ok(2)
}

pub(crate) fn remaining_bytes<S>(source: &mut S) -> Result<u64>
where
    S: Seek,
{
    let current_pos = source.stream_position()?;
    let total_len = source.seek(SeekFrom::End(0))?;
    source.seek(SeekFrom::Start(current_pos))?;
    Ok(total_len.saturating_sub(current_pos))
}

pub(crate) fn read_bytes<R>(cursor: &mut R, len: usize) -> Result<Vec<u8>>
where
    R: Read,
{
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| anyhow!("Need {} bytes but the buffer is short, {}", len, e))?;
    Ok(buf)
}

pub(crate) fn read_length_prefixed_bytes<R>(cursor: &mut R) -> Result<Vec<u8>>
where
    R: Read,
{
    let len = decode_variable_length(cursor)?;
    read_bytes(cursor, len as usize)
}

pub(crate) fn write_length_prefixed_bytes<W>(cursor: &mut W, bytes: &[u8]) -> Result<()>
where
    W: Write,
{
    encode_variable_length(cursor, bytes.len() as u64)?;
    cursor.write_all(bytes)?;
    Ok(())
}

pub(crate) fn format_instant(instant: Instant, current_ts: Instant) -> String {
    if instant == current_ts {
        return "now".to_string();
    }

    if instant > current_ts {
        let ms = instant.duration_since(current_ts).as_secs_f64() * 1000.0;
        format!("+{ms:.3}ms")
    } else {
        let ms = current_ts.duration_since(instant).as_secs_f64() * 1000.0;
        format!("-{ms:.3}ms")
    }
}

pub(crate) fn hex_dump(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
