//! Binary field value codec
//!
//! A vector field stores one value per document: the vector's f32 components,
//! little-endian, back to back. There is no header; the dimension is implied by
//! the value length and must be the same for every document of a segment.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{KnnError, KnnResult};
use crate::types::DocId;

/// Encode a vector into its binary field value
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut buf = vec![0u8; vector.len() * 4];
    LittleEndian::write_f32_into(vector, &mut buf);
    buf
}

/// Decode one document's binary value
///
/// `expected` is the field dimension if it is already known for the segment.
/// A dimension that differs from `expected` is a `DimensionMismatch`; any
/// other encoding problem is reported as `MalformedVector` for `doc`.
pub fn decode_vector(doc: DocId, bytes: &[u8], expected: Option<usize>) -> KnnResult<Vec<f32>> {
    if bytes.is_empty() {
        return Err(KnnError::MalformedVector {
            doc,
            reason: "empty value".to_string(),
        });
    }
    if bytes.len() % 4 != 0 {
        return Err(KnnError::MalformedVector {
            doc,
            reason: format!("value length {} is not a multiple of 4", bytes.len()),
        });
    }
    let dimension = bytes.len() / 4;
    if let Some(expected) = expected {
        if dimension != expected {
            return Err(KnnError::DimensionMismatch {
                expected,
                got: dimension,
            });
        }
    }

    let mut vector = vec![0f32; dimension];
    LittleEndian::read_f32_into(bytes, &mut vector);
    if let Some(pos) = vector.iter().position(|v| !v.is_finite()) {
        return Err(KnnError::MalformedVector {
            doc,
            reason: format!("component {} is not finite", pos),
        });
    }
    Ok(vector)
}
