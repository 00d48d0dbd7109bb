//! Vector file readers for the driver.
//!
//! Two input formats:
//!
//! - **ASCII**: one vector per line, whitespace-separated floats. The
//!   dimensionality is taken from the first non-empty line and every later
//!   line must match it.
//! - **Binary**: a `u64` dimension count (little-endian) followed by packed
//!   little-endian `f32` records.
//!
//! Files are read whole; the parsers themselves are pure functions over the
//! buffer, which keeps them trivially testable.

use std::fs;
use std::path::Path;

use crate::tree::ParseError;
use crate::vector::Vector;

/// Parse whitespace-separated ASCII vectors, one per line.
///
/// Returns the dimensionality and the vectors.
///
/// # Errors
///
/// [`ParseError::MalformedToken`] for a non-float token,
/// [`ParseError::FieldCount`] for a line that disagrees with the first
/// line's dimensionality, and [`ParseError::TruncatedStream`] when the
/// input has no vectors at all.
pub fn parse_ascii(text: &str) -> Result<(usize, Vec<Vector>), ParseError> {
    let mut dims = 0usize;
    let mut vectors = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let mut values = Vec::with_capacity(dims);
        for token in line.split_whitespace() {
            let value: f32 = token.parse().map_err(|_| ParseError::MalformedToken {
                token: token.to_string(),
            })?;
            values.push(value);
        }

        if dims == 0 {
            dims = values.len();
        } else if values.len() != dims {
            return Err(ParseError::FieldCount {
                expected: dims,
                found: values.len(),
            });
        }

        vectors.push(Vector::from_slice(&values));
    }

    if vectors.is_empty() {
        return Err(ParseError::TruncatedStream);
    }

    Ok((dims, vectors))
}

/// Parse the binary format: `[u64 dimensions][f32 records...]`.
///
/// # Errors
///
/// [`ParseError::TruncatedStream`] when the header is short or the payload
/// is not a whole number of records, [`ParseError::MalformedToken`] for a
/// zero dimension count.
pub fn parse_binary(bytes: &[u8]) -> Result<(usize, Vec<Vector>), ParseError> {
    let Some((header, payload)) = bytes.split_at_checked(8) else {
        return Err(ParseError::TruncatedStream);
    };

    let dims_raw = u64::from_le_bytes(header.try_into().expect("header is 8 bytes"));
    let dims = usize::try_from(dims_raw).map_err(|_| ParseError::MalformedToken {
        token: dims_raw.to_string(),
    })?;
    if dims == 0 {
        return Err(ParseError::MalformedToken {
            token: "0".to_string(),
        });
    }

    let Some(stride) = dims.checked_mul(size_of::<f32>()) else {
        return Err(ParseError::MalformedToken {
            token: dims_raw.to_string(),
        });
    };
    if !payload.len().is_multiple_of(stride) {
        return Err(ParseError::TruncatedStream);
    }

    let mut vectors = Vec::with_capacity(payload.len() / stride);
    for record in payload.chunks_exact(stride) {
        let values: Vec<f32> = record
            .chunks_exact(size_of::<f32>())
            .map(|lane| f32::from_le_bytes(lane.try_into().expect("lane is 4 bytes")))
            .collect();
        vectors.push(Vector::from_slice(&values));
    }

    Ok((dims, vectors))
}

/// Read and parse an ASCII vector file.
///
/// # Errors
///
/// [`ParseError::Io`] when the file cannot be read, plus everything
/// [`parse_ascii`] reports.
pub fn read_ascii_file(path: &Path) -> Result<(usize, Vec<Vector>), ParseError> {
    let text = fs::read_to_string(path).map_err(ParseError::Io)?;
    parse_ascii(&text)
}

/// Read and parse a binary vector file.
///
/// # Errors
///
/// [`ParseError::Io`] when the file cannot be read, plus everything
/// [`parse_binary`] reports.
pub fn read_binary_file(path: &Path) -> Result<(usize, Vec<Vector>), ParseError> {
    let bytes = fs::read(path).map_err(ParseError::Io)?;
    parse_binary(&bytes)
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_infers_dimensionality_from_first_line() {
        let (dims, vectors) = parse_ascii("1.0 2.0 3.0\n4.0 5.0 6.0\n\n7.0 8.0 9.0\n").unwrap();

        assert_eq!(dims, 3);
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[1].to_vec(), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_ascii_rejects_ragged_lines() {
        let error = parse_ascii("1.0 2.0\n3.0\n").unwrap_err();

        assert!(matches!(
            error,
            ParseError::FieldCount {
                expected: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn test_ascii_rejects_non_floats() {
        let error = parse_ascii("1.0 banana\n").unwrap_err();

        assert!(matches!(error, ParseError::MalformedToken { .. }));
    }

    #[test]
    fn test_ascii_rejects_empty_input() {
        assert!(matches!(
            parse_ascii("\n\n").unwrap_err(),
            ParseError::TruncatedStream
        ));
    }

    #[test]
    fn test_binary_round_trip() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u64.to_le_bytes());
        for value in [1.5f32, -2.0, 3.25, 4.0] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        let (dims, vectors) = parse_binary(&bytes).unwrap();

        assert_eq!(dims, 2);
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].to_vec(), vec![1.5, -2.0]);
        assert_eq!(vectors[1].to_vec(), vec![3.25, 4.0]);
    }

    #[test]
    fn test_binary_rejects_short_header() {
        assert!(matches!(
            parse_binary(&[1, 2, 3]).unwrap_err(),
            ParseError::TruncatedStream
        ));
    }

    #[test]
    fn test_binary_rejects_partial_record() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u64.to_le_bytes());
        bytes.extend_from_slice(&1.0f32.to_le_bytes());

        assert!(matches!(
            parse_binary(&bytes).unwrap_err(),
            ParseError::TruncatedStream
        ));
    }
}
