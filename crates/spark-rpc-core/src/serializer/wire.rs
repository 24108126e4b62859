//! 有序二进制编码的底层原语。
//!
//! 整数采用 zig-zag + 变长编码，字节串与字符串以长度前缀开头，浮点数为小端定长。
//! 读取函数在越界或格式错误时返回 [`RpcError::Serializer`]，从不 panic。

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, RpcError};

const MAX_VARINT_BYTES: usize = 10;

fn truncated(what: &str) -> RpcError {
    RpcError::Serializer(format!("unexpected end of input while reading {what}"))
}

pub(crate) fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub(crate) fn put_long(buf: &mut BytesMut, value: i64) {
    put_varint(buf, ((value << 1) ^ (value >> 63)) as u64);
}

pub(crate) fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

pub(crate) fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    put_long(buf, value.len() as i64);
    buf.put_slice(value);
}

pub(crate) fn put_f32(buf: &mut BytesMut, value: f32) {
    buf.put_f32_le(value);
}

pub(crate) fn put_f64(buf: &mut BytesMut, value: f64) {
    buf.put_f64_le(value);
}

pub(crate) fn get_varint(buf: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    for index in 0..MAX_VARINT_BYTES {
        if !buf.has_remaining() {
            return Err(truncated("varint"));
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(RpcError::Serializer("varint is longer than 10 bytes".into()))
}

pub(crate) fn get_long(buf: &mut &[u8]) -> Result<i64> {
    let raw = get_varint(buf)?;
    Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
}

pub(crate) fn get_int(buf: &mut &[u8]) -> Result<i32> {
    let value = get_long(buf)?;
    i32::try_from(value)
        .map_err(|_| RpcError::Serializer(format!("value {value} is out of the int range")))
}

pub(crate) fn get_bool(buf: &mut &[u8]) -> Result<bool> {
    if !buf.has_remaining() {
        return Err(truncated("boolean"));
    }
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(RpcError::Serializer(format!("invalid boolean byte {other:#04x}"))),
    }
}

/// 读取长度前缀，并确认剩余输入足够。
pub(crate) fn get_len(buf: &mut &[u8], what: &str) -> Result<usize> {
    let len = get_long(buf)?;
    let len = usize::try_from(len)
        .map_err(|_| RpcError::Serializer(format!("negative {what} length {len}")))?;
    if len > buf.remaining() {
        return Err(truncated(what));
    }
    Ok(len)
}

pub(crate) fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let len = get_len(buf, "bytes")?;
    let (head, tail) = buf.split_at(len);
    let out = head.to_vec();
    *buf = tail;
    Ok(out)
}

pub(crate) fn get_string(buf: &mut &[u8]) -> Result<String> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw).map_err(|err| RpcError::Serializer(format!("invalid utf-8: {err}")))
}

pub(crate) fn get_f32(buf: &mut &[u8]) -> Result<f32> {
    if buf.remaining() < 4 {
        return Err(truncated("float"));
    }
    Ok(buf.get_f32_le())
}

pub(crate) fn get_f64(buf: &mut &[u8]) -> Result<f64> {
    if buf.remaining() < 8 {
        return Err(truncated("double"));
    }
    Ok(buf.get_f64_le())
}
