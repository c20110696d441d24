//! Local shard reading and writing.

use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

use log;

use crate::record::{Record, RECORD_SIZE};

/// Reads records from a shard file.
///
/// A trailing chunk shorter than [`RECORD_SIZE`] is not a record; it is discarded with a warning.
pub fn load_shard(path: &Path, buf_size: Option<usize>) -> io::Result<Vec<Record>> {
    let file = fs::File::open(path)?;
    let reader = match buf_size {
        Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
        None => io::BufReader::new(file),
    };

    let records = read_records(reader)?;
    log::info!("read {} records from {}", records.len(), path.display());

    return Ok(records);
}

/// Reads records from a byte stream until the end of the stream.
pub fn read_records(mut reader: impl Read) -> io::Result<Vec<Record>> {
    let mut records = Vec::new();
    let mut buf = [0u8; RECORD_SIZE];

    loop {
        let mut filled = 0;
        while filled < RECORD_SIZE {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        match filled {
            0 => break,
            RECORD_SIZE => records.push(Record::new(buf)),
            partial => {
                log::warn!("discarding {} trailing bytes not forming a record", partial);
                break;
            }
        }
    }

    return Ok(records);
}

/// Writes records to a shard file in the given order with no delimiters.
///
/// Data is written to a temporary file next to the destination which replaces the destination only once all
/// records are written and synced, so a failed write never leaves a partial output behind.
pub fn write_shard<'a>(
    path: &Path,
    records: impl IntoIterator<Item = &'a Record>,
    buf_size: Option<usize>,
) -> io::Result<usize> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let tmp_file = tempfile::NamedTempFile::new_in(dir)?;

    let mut writer = match buf_size {
        Some(buf_size) => io::BufWriter::with_capacity(buf_size, tmp_file),
        None => io::BufWriter::new(tmp_file),
    };

    let mut count = 0;
    for record in records.into_iter() {
        writer.write_all(record.as_bytes())?;
        count += 1;
    }

    let tmp_file = writer.into_inner().map_err(|err| err.into_error())?;
    tmp_file.as_file().sync_all()?;
    tmp_file.persist(path).map_err(|err| err.error)?;

    log::info!("wrote {} records to {}", count, path.display());
    return Ok(count);
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io;

    use rstest::*;

    use super::{load_shard, read_records, write_shard};
    use crate::record::{Record, RECORD_SIZE};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn records(count: u8) -> Vec<Record> {
        (0..count).map(|i| Record::new([i + 1; RECORD_SIZE])).collect()
    }

    /// Reader returning at most `step` bytes per read call.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl<'a> io::Read for Trickle<'a> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(RECORD_SIZE - 1)]
    fn test_trailing_partial_record_discarded(#[case] trailing: usize) {
        let saved = records(3);
        let mut bytes: Vec<u8> = saved.iter().flat_map(|r| r.as_bytes().to_vec()).collect();
        bytes.extend(std::iter::repeat(0xee).take(trailing));

        let restored = read_records(Trickle { data: &bytes, step: 7 }).unwrap();

        assert_eq!(restored, saved);
    }

    #[rstest]
    fn test_write_and_load(tmp_dir: tempfile::TempDir) {
        let saved = records(10);
        let path = tmp_dir.path().join("output");

        let written = write_shard(&path, &saved, Some(64)).unwrap();
        assert_eq!(written, 10);
        assert_eq!(fs::metadata(&path).unwrap().len(), (10 * RECORD_SIZE) as u64);

        let restored = load_shard(&path, None).unwrap();
        assert_eq!(restored, saved);
    }

    #[rstest]
    fn test_write_replaces_existing_file(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("output");
        fs::write(&path, b"stale content").unwrap();

        write_shard(&path, &records(1), None).unwrap();

        assert_eq!(load_shard(&path, None).unwrap(), records(1));
        assert_eq!(fs::read_dir(tmp_dir.path()).unwrap().count(), 1);
    }

    #[rstest]
    fn test_load_missing_file(tmp_dir: tempfile::TempDir) {
        let err = load_shard(&tmp_dir.path().join("missing"), None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
