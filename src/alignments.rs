//src/alignments.rs

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use flate2::read::MultiGzDecoder;

use crate::error::{Result, ShogunError};
use crate::types::{AlignmentHit, TaxId};

/// Opens a plain or gzipped text file for line-oriented reading.
pub fn open_text<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let f = File::open(path).map_err(ShogunError::at_path(path))?;

    let is_gz = path
        .extension()
        .map(|ext| ext == "gz")
        .unwrap_or(false);

    Ok(if is_gz {
        Box::new(BufReader::new(MultiGzDecoder::new(f)))
    } else {
        Box::new(BufReader::new(f))
    })
}

/// Column layout of an aligner's tabular output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentFormat {
    /// SAM body lines: `qname flag rname ...`.
    Sam,
    /// BLAST tabular (`-outfmt 6`, embalmer `.b6`): `query subject ...`.
    Blast6,
    /// utree search output: `query lca confidence support`.
    Utree,
}

impl AlignmentFormat {
    /// Zero-based column holding the reference id (or label for utree).
    pub fn reference_column(self) -> usize {
        match self {
            AlignmentFormat::Sam => 2,
            AlignmentFormat::Blast6 | AlignmentFormat::Utree => 1,
        }
    }
}

/// Parses one line of aligner output.
///
/// `Ok(None)` is returned for lines that carry no hit (blank lines, SAM
/// headers, unmapped SAM records); lines with too few columns are a format
/// error for that line only.
pub fn parse_alignment_line(line: &str, format: AlignmentFormat) -> std::result::Result<Option<AlignmentHit>, String> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.is_empty() || (format == AlignmentFormat::Sam && line.starts_with('@')) {
        return Ok(None);
    }

    let col = format.reference_column();
    let mut fields = line.split('\t');
    let query = fields.next().unwrap_or("");
    let reference = match fields.nth(col - 1) {
        Some(r) => r,
        None => {
            return Err(format!(
                "expected at least {} tab-separated columns, found {}",
                col + 1,
                line.split('\t').count()
            ))
        }
    };

    if query.is_empty() || reference.is_empty() {
        return Err("empty query or reference column".to_string());
    }
    if format == AlignmentFormat::Sam && reference == "*" {
        return Ok(None);
    }

    Ok(Some(AlignmentHit {
        query_id: query.to_string(),
        reference_id: reference.to_string(),
        line: 0,
    }))
}

/// Streams `(query, reference)` pairs out of an alignment file.
///
/// Every malformed line surfaces as a `ShogunError::Format` item; the stream
/// keeps going afterwards, so callers can skip or abort as they see fit.
pub struct AlignmentRecords<R: BufRead> {
    reader: R,
    format: AlignmentFormat,
    source_name: String,
    line_no: usize,
    buf: String,
}

impl AlignmentRecords<Box<dyn BufRead>> {
    pub fn open<P: AsRef<Path>>(path: P, format: AlignmentFormat) -> Result<Self> {
        let path = path.as_ref();
        let reader = open_text(path)?;
        Ok(Self::new(reader, format, path.display().to_string()))
    }
}

impl<R: BufRead> AlignmentRecords<R> {
    pub fn new(reader: R, format: AlignmentFormat, source_name: impl Into<String>) -> Self {
        Self {
            reader,
            format,
            source_name: source_name.into(),
            line_no: 0,
            buf: String::with_capacity(512),
        }
    }
}

impl<R: BufRead> Iterator for AlignmentRecords<R> {
    type Item = Result<AlignmentHit>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
            self.line_no += 1;

            match parse_alignment_line(&self.buf, self.format) {
                Ok(Some(hit)) => {
                    return Some(Ok(AlignmentHit {
                        line: self.line_no,
                        ..hit
                    }))
                }
                Ok(None) => continue,
                Err(msg) => {
                    return Some(Err(ShogunError::format(
                        self.source_name.clone(),
                        self.line_no,
                        msg,
                    )))
                }
            }
        }
    }
}

/// The pair of strings that sandwich a taxon id inside a reference id,
/// e.g. `ncbi_tid|` and `|` in `gi|1|ncbi_tid|562|`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonMarkers {
    pub begin: String,
    pub end: String,
}

impl Default for TaxonMarkers {
    fn default() -> Self {
        Self {
            begin: "ncbi_tid|".to_string(),
            end: "|".to_string(),
        }
    }
}

impl FromStr for TaxonMarkers {
    type Err = ShogunError;

    /// Accepts the `begin,end` form used on the command line.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(',') {
            Some((begin, end)) if !begin.is_empty() && !end.is_empty() => Ok(Self {
                begin: begin.to_string(),
                end: end.to_string(),
            }),
            _ => Err(ShogunError::config(format!(
                "taxon markers must look like `begin,end`, got `{s}`"
            ))),
        }
    }
}

impl TaxonMarkers {
    /// Pulls the taxon id out of a reference id.
    pub fn extract(&self, reference_id: &str) -> std::result::Result<TaxId, String> {
        let start = reference_id
            .find(&self.begin)
            .map(|i| i + self.begin.len())
            .ok_or_else(|| format!("marker `{}` not found in `{reference_id}`", self.begin))?;
        let rest = &reference_id[start..];
        let stop = rest
            .find(&self.end)
            .ok_or_else(|| format!("marker `{}` not found after `{}` in `{reference_id}`", self.end, self.begin))?;
        rest[..stop]
            .trim()
            .parse::<TaxId>()
            .map_err(|_| format!("`{}` in `{reference_id}` is not a taxon id", &rest[..stop]))
    }
}
