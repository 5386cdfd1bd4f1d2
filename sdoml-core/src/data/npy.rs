//! NumPy `.npy` codec for 2-D float arrays.
//!
//! Packaged entries are written as `<f4` in C order. Raw files may hold
//! `<f4` or `<f8` data in either memory order; `<f8` is narrowed to `f32`.

use super::decode::DecodeError;
use crate::domain::Frame;
use ndarray::Array2;
use ndarray_npy::{ReadNpyError, ReadNpyExt, WriteNpyError, WriteNpyExt};

/// Encode a frame as a complete `.npy` file.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, WriteNpyError> {
    let mut out = Vec::with_capacity(128 + frame.as_array().len() * 4);
    frame.as_array().write_npy(&mut out)?;
    Ok(out)
}

/// Decode a `.npy` byte buffer into a frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let pixels = match Array2::<f32>::read_npy(bytes) {
        Ok(pixels) => pixels,
        Err(ReadNpyError::WrongDescriptor(_)) => Array2::<f64>::read_npy(bytes)?.mapv(|v| v as f32),
        Err(e) => return Err(e.into()),
    };
    Ok(Frame::from_array(pixels)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    const MAGIC: &[u8; 6] = b"\x93NUMPY";

    /// A version 1.0 file with a hand-written header dict.
    fn npy_with_header(dict: &str, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&[1, 0]);
        bytes.extend_from_slice(&((dict.len() + 1) as u16).to_le_bytes());
        bytes.extend_from_slice(dict.as_bytes());
        bytes.push(b'\n');
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn encodes_f4_c_order_and_reads_back() {
        let frame = Frame::new(2, 3, vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5]).unwrap();
        let bytes = encode(&frame).unwrap();
        assert_eq!(&bytes[..6], MAGIC);
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        let header = std::str::from_utf8(&bytes[10..10 + header_len]).unwrap();
        assert!(header.contains("<f4"));
        assert!(header.contains("False"));
        assert_eq!((10 + header_len) % 16, 0);
        assert_eq!(bytes.len(), 10 + header_len + 6 * 4);
        assert_eq!(decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn reads_f8_payloads() {
        let dict = "{'descr': '<f8', 'fortran_order': False, 'shape': (1, 2), }";
        let mut payload = Vec::new();
        payload.extend_from_slice(&0.25f64.to_le_bytes());
        payload.extend_from_slice(&4.0f64.to_le_bytes());
        let frame = decode(&npy_with_header(dict, &payload)).unwrap();
        assert_eq!(frame.as_array(), &array![[0.25f32, 4.0]]);
    }

    #[test]
    fn reads_fortran_order_into_row_major() {
        let dict = "{'descr': '<f4', 'fortran_order': True, 'shape': (2, 2), }";
        let payload: Vec<u8> = [1.0f32, 3.0, 2.0, 4.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let frame = decode(&npy_with_header(dict, &payload)).unwrap();
        assert_eq!(frame.as_array(), &array![[1.0f32, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn rejects_garbage_and_truncation() {
        assert!(decode(b"SIMPLE  =                    T").is_err());
        let bytes = encode(&Frame::filled(4, 4, 1.0)).unwrap();
        assert!(decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn overflowing_shape_is_a_decode_error() {
        let dict = "{'descr': '<f4', 'fortran_order': False, 'shape': (4611686018427387904, 4), }";
        let result = std::panic::catch_unwind(|| decode(&npy_with_header(dict, &[0u8; 16])));
        assert!(matches!(result, Ok(Err(DecodeError::Npy(_)))));
    }

    #[test]
    fn rejects_non_2d_and_other_dtypes() {
        let one_d = "{'descr': '<f4', 'fortran_order': False, 'shape': (4,), }";
        let ints = "{'descr': '<i2', 'fortran_order': False, 'shape': (1, 1), }";
        let empty = "{'descr': '<f4', 'fortran_order': False, 'shape': (0, 4), }";
        for dict in [one_d, ints] {
            assert!(decode(&npy_with_header(dict, &[0u8; 16])).is_err());
        }
        assert!(matches!(
            decode(&npy_with_header(empty, &[])),
            Err(DecodeError::Shape(_))
        ));
    }
}
