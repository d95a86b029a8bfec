//! Readers for the `.fvecs` / `.bvecs` / `.ivecs` vector file formats.
//!
//! Every record is a 4-byte little-endian prefix followed by `dim`
//! little-endian components. The prefix is skipped; the caller supplies the
//! dimension.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};
use std::path::Path;

/// Fixed-width little-endian vector component.
pub trait Component: Copy {
    const SIZE: usize;

    /// Decode from exactly `Self::SIZE` bytes.
    fn from_le_slice(bytes: &[u8]) -> Self;
}

impl Component for f32 {
    const SIZE: usize = 4;

    fn from_le_slice(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl Component for u32 {
    const SIZE: usize = 4;

    fn from_le_slice(bytes: &[u8]) -> Self {
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl Component for u8 {
    const SIZE: usize = 1;

    fn from_le_slice(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

const PREFIX_SIZE: usize = 4;

/// Read up to `limit` records of `dim` components each.
///
/// A clean end of input stops the read early; a record cut off part way is
/// an `UnexpectedEof` error.
pub fn read_vecs_from_reader<R, T>(
    mut reader: R,
    dim: usize,
    limit: Option<usize>,
) -> io::Result<Vec<Vec<T>>>
where
    R: Read,
    T: Component,
{
    if dim == 0 {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "vector dimension must be positive",
        ));
    }

    let mut vectors = Vec::new();
    let mut buffer = vec![0u8; PREFIX_SIZE + dim * T::SIZE];

    loop {
        if let Some(max) = limit {
            if vectors.len() >= max {
                break;
            }
        }

        if !fill_record(&mut reader, &mut buffer, vectors.len())? {
            break;
        }
        let vector: Vec<T> = buffer[PREFIX_SIZE..]
            .chunks_exact(T::SIZE)
            .map(T::from_le_slice)
            .collect();
        vectors.push(vector);
    }

    Ok(vectors)
}

/// Fill `buffer` with one record. Returns `false` on end of input before the
/// first byte.
fn fill_record<R: Read>(reader: &mut R, buffer: &mut [u8], record: usize) -> io::Result<bool> {
    let mut filled = 0usize;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!(
                        "record {record} is truncated: got {filled} of {} bytes",
                        buffer.len()
                    ),
                ))
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

pub fn read_fvecs_from_reader<R: Read>(
    reader: R,
    dim: usize,
    limit: Option<usize>,
) -> io::Result<Vec<Vec<f32>>> {
    read_vecs_from_reader(reader, dim, limit)
}

/// Byte vectors, widened to `f32`.
pub fn read_bvecs_from_reader<R: Read>(
    reader: R,
    dim: usize,
    limit: Option<usize>,
) -> io::Result<Vec<Vec<f32>>> {
    let raw: Vec<Vec<u8>> = read_vecs_from_reader(reader, dim, limit)?;
    Ok(widen(&raw))
}

pub fn read_ivecs_from_reader<R: Read>(
    reader: R,
    dim: usize,
    limit: Option<usize>,
) -> io::Result<Vec<Vec<u32>>> {
    read_vecs_from_reader(reader, dim, limit)
}

pub fn read_fvecs<P: AsRef<Path>>(
    path: P,
    dim: usize,
    limit: Option<usize>,
) -> io::Result<Vec<Vec<f32>>> {
    let file = File::open(path)?;
    read_fvecs_from_reader(BufReader::new(file), dim, limit)
}

pub fn read_bvecs<P: AsRef<Path>>(
    path: P,
    dim: usize,
    limit: Option<usize>,
) -> io::Result<Vec<Vec<f32>>> {
    let file = File::open(path)?;
    read_bvecs_from_reader(BufReader::new(file), dim, limit)
}

pub fn read_ivecs<P: AsRef<Path>>(
    path: P,
    dim: usize,
    limit: Option<usize>,
) -> io::Result<Vec<Vec<u32>>> {
    let file = File::open(path)?;
    read_ivecs_from_reader(BufReader::new(file), dim, limit)
}

/// Convert byte vectors to the index's `f32` storage type.
pub fn widen(vectors: &[Vec<u8>]) -> Vec<Vec<f32>> {
    vectors
        .iter()
        .map(|vector| vector.iter().map(|&component| f32::from(component)).collect())
        .collect()
}
