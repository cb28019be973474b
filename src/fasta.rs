//src/fasta.rs

use ahash::AHashMap;
use bio::io::fasta;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, ShogunError};

/// One FASTA record fetched from an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastaRecord {
    pub name: String,
    pub seq: String,
}

impl FastaRecord {
    pub fn write_to<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writeln!(writer, ">{}\n{}", self.name, self.seq)
    }
}

/// `<fasta>.fai`, where samtools and pyfaidx keep their index.
pub fn fai_path(fasta: &Path) -> PathBuf {
    let mut name = fasta.as_os_str().to_owned();
    name.push(".fai");
    PathBuf::from(name)
}

/// Random-access FASTA lookup by record name.
///
/// Backed by a faidx index: an existing `.fai` at least as new as the FASTA
/// is reused, otherwise one is built and saved next to the file. The reader
/// is shared behind a lock so refinement tasks can fetch concurrently.
pub struct FastaIndex {
    path: PathBuf,
    lengths: AHashMap<String, u64>,
    reader: Mutex<fasta::IndexedReader<File>>,
}

impl FastaIndex {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let fai = fai_path(&path);

        let fai_text = if is_fresh(&fai, &path) {
            log::debug!("Reusing index {}", fai.display());
            fs::read(&fai).map_err(ShogunError::at_path(&fai))?
        } else {
            let text = build_fai(&path)?;
            if let Err(e) = fs::write(&fai, &text) {
                log::debug!("Keeping index for {} in memory ({e})", path.display());
            }
            text
        };

        let index = fasta::Index::new(fai_text.as_slice())
            .map_err(|e| ShogunError::format(fai.display().to_string(), 0, e.to_string()))?;
        let lengths: AHashMap<String, u64> = index
            .sequences()
            .into_iter()
            .map(|s| (s.name, s.len))
            .collect();

        let file = File::open(&path).map_err(ShogunError::at_path(&path))?;
        log::debug!("Indexed {} FASTA records in {}", lengths.len(), path.display());
        Ok(Self {
            path,
            lengths,
            reader: Mutex::new(fasta::IndexedReader::with_index(file, index)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    /// Fetches a record by name; `Lookup` error when absent.
    pub fn fetch(&self, name: &str) -> Result<FastaRecord> {
        let len = *self.lengths.get(name).ok_or_else(|| ShogunError::Lookup {
            what: "sequence",
            name: name.to_string(),
        })?;

        let mut raw = Vec::with_capacity(len as usize);
        if len > 0 {
            let mut reader = self.reader.lock();
            reader.fetch_all(name)?;
            reader.read(&mut raw)?;
        }

        let seq = String::from_utf8(raw).map_err(|_| {
            ShogunError::format(
                self.path.display().to_string(),
                0,
                format!("sequence of {name} is not valid UTF-8"),
            )
        })?;
        Ok(FastaRecord {
            name: name.to_string(),
            seq,
        })
    }
}

fn is_fresh(fai: &Path, fasta: &Path) -> bool {
    let modified = |p: &Path| fs::metadata(p).and_then(|m| m.modified()).ok();
    match (modified(fai), modified(fasta)) {
        (Some(index), Some(data)) => index >= data,
        _ => false,
    }
}

/// One `.fai` row under construction.
struct FaiEntry {
    name: String,
    len: u64,
    offset: u64,
    line_bases: u64,
    line_width: u64,
    /// A short or blank line was seen; only the last line may be short.
    ended: bool,
}

impl FaiEntry {
    fn add_line(&mut self, line: &[u8]) -> std::result::Result<(), String> {
        let bases = line
            .iter()
            .rev()
            .skip_while(|&&b| b == b'\n' || b == b'\r')
            .count() as u64;
        if bases == 0 {
            self.ended = self.line_bases > 0;
            return Ok(());
        }
        if self.ended {
            return Err(format!("record {} has lines of differing length", self.name));
        }

        if self.line_bases == 0 {
            self.line_bases = bases;
            self.line_width = if line.ends_with(b"\n") {
                line.len() as u64
            } else {
                bases + 1
            };
        } else if bases > self.line_bases {
            return Err(format!("record {} has lines of differing length", self.name));
        } else if bases < self.line_bases {
            self.ended = true;
        }
        self.len += bases;
        Ok(())
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(
            format!(
                "{}\t{}\t{}\t{}\t{}\n",
                self.name, self.len, self.offset, self.line_bases, self.line_width
            )
            .as_bytes(),
        );
    }
}

/// Scans `path` once and renders its faidx index. Works on raw bytes, so
/// header descriptions need not be UTF-8; the record name is the header up
/// to the first whitespace.
fn build_fai(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(ShogunError::at_path(path))?;
    let mut reader = BufReader::with_capacity(1024 * 1024, file);
    let source_name = path.display().to_string();

    let mut fai = Vec::new();
    let mut line = Vec::with_capacity(256);
    let mut pos = 0u64;
    let mut line_no = 0usize;
    let mut current: Option<FaiEntry> = None;
    let mut seen: AHashMap<String, usize> = AHashMap::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)? as u64;
        line_no += 1;

        if n == 0 || line.first() == Some(&b'>') {
            if let Some(entry) = current.take() {
                entry.write_to(&mut fai);
            }
            if n == 0 {
                break;
            }
            let name_bytes = line[1..]
                .split(|b| b.is_ascii_whitespace())
                .next()
                .unwrap_or_default();
            let name = String::from_utf8_lossy(name_bytes).into_owned();
            if let Some(first) = seen.insert(name.clone(), line_no) {
                log::warn!(
                    "Duplicate FASTA record {name} in {source_name} (lines {first} and {line_no}); keeping the last"
                );
            }
            current = Some(FaiEntry {
                name,
                len: 0,
                offset: pos + n,
                line_bases: 0,
                line_width: 0,
                ended: false,
            });
        } else if let Some(entry) = current.as_mut() {
            entry
                .add_line(&line)
                .map_err(|msg| ShogunError::format(source_name.clone(), line_no, msg))?;
        }
        pos += n;
    }
    Ok(fai)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fasta(bytes: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seqs.fna");
        let mut f = File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        (dir, path)
    }

    #[test]
    fn fetch_multiline_records() {
        let (_dir, path) = write_fasta(b">r1 first read\nACGT\nAC\n>r2\nGGGG\n>r3\r\nTT\r\nAA\r\n");
        let idx = FastaIndex::open(&path).unwrap();
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.fetch("r1").unwrap().seq, "ACGTAC");
        assert_eq!(idx.fetch("r2").unwrap().seq, "GGGG");
        assert_eq!(idx.fetch("r3").unwrap().seq, "TTAA");
        assert_eq!(idx.fetch("r1").unwrap().name, "r1");
    }

    #[test]
    fn index_is_saved_as_fai_and_reused() {
        let (_dir, path) = write_fasta(b">r1 first read\nACGT\nAC\n>r2\nGGGG\n>r3\r\nTT\r\nAA\r\n");
        FastaIndex::open(&path).unwrap();
        assert_eq!(
            fs::read_to_string(fai_path(&path)).unwrap(),
            "r1\t6\t15\t4\t5\nr2\t4\t27\t4\t5\nr3\t4\t37\t2\t4\n"
        );

        let again = FastaIndex::open(&path).unwrap();
        assert_eq!(again.path(), path.as_path());
        assert_eq!(again.fetch("r3").unwrap().seq, "TTAA");
    }

    #[test]
    fn non_utf8_header_description_is_fine() {
        let (_dir, path) = write_fasta(b">r1 Escherichia coli \xE9t\xE9\nACGT\n>r2\nGGGG\n");
        let idx = FastaIndex::open(&path).unwrap();
        assert_eq!(idx.fetch("r1").unwrap().seq, "ACGT");
        assert_eq!(idx.fetch("r2").unwrap().seq, "GGGG");
    }

    #[test]
    fn missing_record_is_a_lookup_error() {
        let (_dir, path) = write_fasta(b">r1\nACGT\n");
        let idx = FastaIndex::open(&path).unwrap();
        assert!(matches!(idx.fetch("nope"), Err(ShogunError::Lookup { .. })));
    }

    #[test]
    fn last_record_without_trailing_newline() {
        let (_dir, path) = write_fasta(b">a\nAC\n>b\nGT");
        let idx = FastaIndex::open(&path).unwrap();
        assert_eq!(idx.fetch("a").unwrap().seq, "AC");
        assert_eq!(idx.fetch("b").unwrap().seq, "GT");
    }

    #[test]
    fn empty_record_fetches_empty_sequence() {
        let (_dir, path) = write_fasta(b">empty\n>b\nGT\n");
        let idx = FastaIndex::open(&path).unwrap();
        assert_eq!(idx.fetch("empty").unwrap().seq, "");
        assert_eq!(idx.fetch("b").unwrap().seq, "GT");
    }

    #[test]
    fn ragged_lines_are_a_format_error() {
        let (_dir, path) = write_fasta(b">a\nAC\nACGT\n");
        assert!(matches!(
            FastaIndex::open(&path),
            Err(ShogunError::Format { line: 3, .. })
        ));
    }

    #[test]
    fn record_writes_as_fasta() {
        let rec = FastaRecord { name: "q1".into(), seq: "ACGT".into() };
        let mut out = Vec::new();
        rec.write_to(&mut out).unwrap();
        assert_eq!(out, b">q1\nACGT\n");
    }
}
