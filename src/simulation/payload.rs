//! Aggregated burst payloads.
//!
//! Several upper-layer PDUs queued on one channel travel in a single data
//! burst. The wire layout is little-endian:
//!
//! ```text
//! count: u16 | (len: u16 | bytes[len]) × count
//! ```

use super::error::SimError;

/// Pack PDUs into one payload, preserving their order.
pub fn pack<T: AsRef<[u8]>>(pdus: &[T]) -> Result<Vec<u8>, SimError> {
    let count = u16::try_from(pdus.len()).map_err(|_| SimError::MalformedPayload(format!("{} PDUs in one burst", pdus.len())))?;
    let total: usize = pdus.iter().map(|p| p.as_ref().len() + 2).sum();
    let mut out = Vec::with_capacity(2 + total);
    out.extend_from_slice(&count.to_le_bytes());
    for pdu in pdus {
        let bytes = pdu.as_ref();
        let len = u16::try_from(bytes.len()).map_err(|_| SimError::MalformedPayload(format!("PDU of {} bytes", bytes.len())))?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(bytes);
    }
    Ok(out)
}

/// Split a packed payload back into its PDUs.
pub fn unpack(payload: &[u8]) -> Result<Vec<Vec<u8>>, SimError> {
    let (count, mut rest) = read_u16(payload)?;
    let mut pdus = Vec::with_capacity(count as usize);
    for index in 0..count {
        let (len, tail) = read_u16(rest)?;
        let len = len as usize;
        if tail.len() < len {
            return Err(SimError::MalformedPayload(format!(
                "PDU {} claims {} bytes, {} left",
                index,
                len,
                tail.len()
            )));
        }
        pdus.push(tail[..len].to_vec());
        rest = &tail[len..];
    }
    if !rest.is_empty() {
        return Err(SimError::MalformedPayload(format!("{} trailing bytes", rest.len())));
    }
    Ok(pdus)
}

fn read_u16(bytes: &[u8]) -> Result<(u16, &[u8]), SimError> {
    match bytes {
        [lo, hi, rest @ ..] => Ok((u16::from_le_bytes([*lo, *hi]), rest)),
        _ => Err(SimError::MalformedPayload("truncated length field".to_string())),
    }
}
