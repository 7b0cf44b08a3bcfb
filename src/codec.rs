//! Binary framing for everything written to the data file: a fixed-width
//! length prefix followed by a JSON payload, optionally padded out to a
//! full slot.

use std::os::unix::fs::FileExt;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// Bytes of the database magic written once at offset 0.
pub const MAGIC: &[u8] = b"key-values-database";

/// Width, in bytes, of the big-endian length field in front of every payload.
pub const LENGTH_PREFIX_SIZE: usize = 64;

/// Size of a reserved slot. A record whose `length prefix + payload` fits
/// under this many bytes is written (and later overwritten) in place;
/// anything larger is relocated to the file tail instead.
pub const SLOT_SIZE: usize = 512;

/// Encode `length` right-aligned into a zero-padded 64-byte big-endian field.
fn encode_length(length: u64) -> [u8; LENGTH_PREFIX_SIZE] {
	let mut buf = [0u8; LENGTH_PREFIX_SIZE];
	buf[LENGTH_PREFIX_SIZE - 8..].copy_from_slice(&length.to_be_bytes());
	buf
}

fn decode_length(buf: &[u8]) -> u64 {
	let mut bytes = [0u8; 8];
	bytes.copy_from_slice(&buf[LENGTH_PREFIX_SIZE - 8..LENGTH_PREFIX_SIZE]);
	u64::from_be_bytes(bytes)
}

/// Encode `value` as `[64-byte length][payload]`, with no slot padding.
/// The caller decides whether the result fits the existing slot (`fits_slot`)
/// or must be relocated.
pub fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>> {
	let payload = serde_json::to_vec(value)?;
	let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
	out.extend_from_slice(&encode_length(payload.len() as u64));
	out.extend_from_slice(&payload);
	Ok(out)
}

/// Whether an encoded record (length prefix + payload) fits a single slot.
pub fn fits_slot(encoded_len: usize) -> bool {
	encoded_len < SLOT_SIZE
}

/// Decode a record previously written by [`encode_record`] out of a buffer
/// that starts at the record's length prefix.
pub fn decode_record<T: DeserializeOwned>(buf: &[u8]) -> Result<T> {
	if buf.len() < LENGTH_PREFIX_SIZE {
		return Err(Error::IncorrectDatabase("truncated record header".into()));
	}
	let length = decode_length(buf) as usize;
	let end = LENGTH_PREFIX_SIZE + length;
	if buf.len() < end {
		return Err(Error::IncorrectDatabase("truncated record payload".into()));
	}
	Ok(serde_json::from_slice(&buf[LENGTH_PREFIX_SIZE..end])?)
}

/// Read at an absolute offset, growing a buffer of exactly `len` bytes.
pub fn read_at(file: &std::fs::File, offset: u64, len: usize) -> Result<Vec<u8>> {
	let mut buf = vec![0u8; len];
	file.read_exact_at(&mut buf, offset)?;
	Ok(buf)
}

/// Zero-fill a full slot at `offset`, then write `bytes` at its start. Used
/// for every table/row/header write, whether it is the record's first
/// appearance or an in-place override of an existing slot.
pub fn write_slot(file: &std::fs::File, offset: u64, bytes: &[u8]) -> Result<()> {
	if bytes.len() <= SLOT_SIZE {
		let padding = vec![0u8; SLOT_SIZE];
		file.write_all_at(&padding, offset)?;
	}
	file.write_all_at(bytes, offset)?;
	Ok(())
}
