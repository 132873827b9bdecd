// Wraparound offset arithmetic and split I/O over the circular data region.
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::trace;

use crate::core::error::{Error, ErrorKind};
use crate::core::layout::DATA_START;

/// Advances `offset` by `step` bytes inside the circular region
/// `[DATA_START, data_end)`. Offsets below the region clamp up to its start;
/// offsets at or past `data_end` reduce modulo the region length. A zero
/// `step` only normalizes. The result is always inside the region.
pub fn advance(offset: u64, data_end: u64, step: u64) -> u64 {
    let span = data_end - DATA_START;
    let rel = offset.saturating_sub(DATA_START);
    (rel + step) % span + DATA_START
}

/// Reads `buf.len()` bytes starting at `offset`, splitting into two reads
/// when the span crosses the high end of the data region. Returns the
/// normalized offset just past the span.
pub fn read_at_wrapped(
    file: &mut File,
    buf: &mut [u8],
    offset: u64,
    data_end: u64,
) -> Result<u64, Error> {
    check_span(buf.len(), data_end)?;
    let offset = advance(offset, data_end, 0);
    let first = (data_end - offset) as usize;
    let result = if buf.len() <= first {
        trace!(len = buf.len(), offset, "single read");
        read_chunk(file, buf, offset)
    } else {
        trace!(len = buf.len(), offset, first, "split read");
        let (head, tail) = buf.split_at_mut(first);
        read_chunk(file, head, offset).and_then(|()| read_chunk(file, tail, DATA_START))
    };
    result.map_err(io_error)?;
    Ok(advance(offset, data_end, buf.len() as u64))
}

/// Write-side counterpart of [`read_at_wrapped`], with the same splitting
/// and offset contract.
pub fn write_at_wrapped(
    file: &mut File,
    buf: &[u8],
    offset: u64,
    data_end: u64,
) -> Result<u64, Error> {
    check_span(buf.len(), data_end)?;
    let offset = advance(offset, data_end, 0);
    let first = (data_end - offset) as usize;
    let result = if buf.len() <= first {
        trace!(len = buf.len(), offset, "single write");
        write_chunk(file, buf, offset)
    } else {
        trace!(len = buf.len(), offset, first, "split write");
        let (head, tail) = buf.split_at(first);
        write_chunk(file, head, offset).and_then(|()| write_chunk(file, tail, DATA_START))
    };
    result.map_err(io_error)?;
    Ok(advance(offset, data_end, buf.len() as u64))
}

// read_exact and write_all retry short transfers and interruption until the
// whole chunk has moved, which is exactly the contract callers need.
fn read_chunk(file: &mut File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

fn write_chunk(file: &mut File, buf: &[u8], offset: u64) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

// A span as large as the whole region would make the post-transfer offset
// ambiguous with the starting offset, so it is rejected outright.
fn check_span(len: usize, data_end: u64) -> Result<(), Error> {
    let capacity = data_end - DATA_START;
    if len as u64 >= capacity {
        return Err(Error::new(ErrorKind::Capacity).with_message("span does not fit the data region"));
    }
    Ok(())
}

fn io_error(err: io::Error) -> Error {
    Error::new(ErrorKind::Io).with_source(err)
}

#[cfg(test)]
mod tests {
    use super::{advance, read_at_wrapped, write_at_wrapped, DATA_START};
    use crate::core::error::ErrorKind;
    use std::fs::{File, OpenOptions};

    fn scratch_file(len: u64) -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.path().join("scratch.ringq"))
            .expect("open");
        file.set_len(len).expect("set_len");
        (dir, file)
    }

    #[test]
    fn advance_wraps_modulo_region() {
        let data_end = DATA_START + 10;
        assert_eq!(advance(DATA_START, data_end, 3), DATA_START + 3);
        assert_eq!(advance(DATA_START + 7, data_end, 5), DATA_START + 2);
        assert_eq!(advance(DATA_START + 9, data_end, 1), DATA_START);
    }

    #[test]
    fn advance_normalizes_out_of_range_offsets() {
        let data_end = DATA_START + 10;
        assert_eq!(advance(0, data_end, 0), DATA_START);
        assert_eq!(advance(data_end, data_end, 0), DATA_START);
        assert_eq!(advance(data_end + 4, data_end, 0), DATA_START + 4);
    }

    #[test]
    fn contiguous_round_trip() {
        let data_end = DATA_START + 32;
        let (_dir, mut file) = scratch_file(data_end);
        let next = write_at_wrapped(&mut file, b"abcdef", DATA_START + 2, data_end).expect("write");
        assert_eq!(next, DATA_START + 8);

        let mut buf = [0u8; 6];
        let next = read_at_wrapped(&mut file, &mut buf, DATA_START + 2, data_end).expect("read");
        assert_eq!(&buf, b"abcdef");
        assert_eq!(next, DATA_START + 8);
    }

    #[test]
    fn boundary_crossing_round_trip() {
        let data_end = DATA_START + 16;
        let (_dir, mut file) = scratch_file(data_end);
        // Starts 4 bytes shy of the end, so the last 6 bytes land at the start.
        let offset = data_end - 4;
        let next = write_at_wrapped(&mut file, b"0123456789", offset, data_end).expect("write");
        assert_eq!(next, DATA_START + 6);

        let mut buf = [0u8; 10];
        read_at_wrapped(&mut file, &mut buf, offset, data_end).expect("read");
        assert_eq!(&buf, b"0123456789");
    }

    #[test]
    fn oversized_span_is_rejected() {
        let data_end = DATA_START + 8;
        let (_dir, mut file) = scratch_file(data_end);
        let err =
            write_at_wrapped(&mut file, &[0u8; 8], DATA_START, data_end).expect_err("too big");
        assert_eq!(err.kind(), ErrorKind::Capacity);

        let mut buf = [0u8; 9];
        let err =
            read_at_wrapped(&mut file, &mut buf, DATA_START, data_end).expect_err("too big");
        assert_eq!(err.kind(), ErrorKind::Capacity);
    }
}
