use std::path::Path;
use anyhow::{anyhow, Result};
use fxhash::FxHashSet;
use rust_htslib::{bam, bam::Read, bam::record::Aux, bam::record::Record};
use crate::config::defs::{PipelineError, BAM_SUFFIX, SAM_SUFFIX};
use crate::utils::file::is_gzipped;

/// One alignment with the fields the pipeline ranks on decoded. The htslib
/// record is kept so it can be written back out unchanged.
#[derive(Debug, Clone)]
pub struct AlignmentRecord {
    pub read_name: String,
    pub mapq: u8,
    pub alignment_score: Option<i64>,
    pub next_best_score: Option<i64>,
    pub mate_score: Option<i64>,
    pub record: Record,
}

/// Integer value of an optional field. Fields of any other type read as absent.
fn integer_tag(record: &Record, tag: &[u8]) -> Option<i64> {
    match record.aux(tag).ok()? {
        Aux::I8(v) => Some(v as i64),
        Aux::U8(v) => Some(v as i64),
        Aux::I16(v) => Some(v as i64),
        Aux::U16(v) => Some(v as i64),
        Aux::I32(v) => Some(v as i64),
        Aux::U32(v) => Some(v as i64),
        _ => None,
    }
}

impl AlignmentRecord {
    pub fn from_record(record: Record) -> Self {
        AlignmentRecord {
            read_name: String::from_utf8_lossy(record.qname()).into_owned(),
            mapq: record.mapq(),
            alignment_score: integer_tag(&record, b"AS"),
            next_best_score: integer_tag(&record, b"XS"),
            mate_score: integer_tag(&record, b"YS"),
            record,
        }
    }

    pub fn is_paired(&self) -> bool {
        self.record.is_paired()
    }

    pub fn is_first_of_pair(&self) -> bool {
        self.record.is_first_in_template()
    }

    pub fn is_unmapped(&self) -> bool {
        self.record.is_unmapped()
    }

    pub fn is_secondary_or_supplementary(&self) -> bool {
        self.record.is_secondary() || self.record.is_supplementary()
    }

    /// Placement and encoded content, used to make ranking total.
    pub fn identity(&self) -> (i32, i64, u16, &[u8]) {
        (self.record.tid(), self.record.pos(), self.record.flags(), self.record.data())
    }
}


/// True when `path` holds BGZF (BAM) rather than text SAM.
pub fn is_bam(path: &Path) -> Result<bool> {
    Ok(is_gzipped(path)?)
}

/// File suffix matching the encoding of an existing alignment file.
pub fn alignment_suffix(path: &Path) -> Result<&'static str> {
    Ok(if is_bam(path)? { BAM_SUFFIX } else { SAM_SUFFIX })
}

/// Opens SAM, BAM or CRAM input; htslib detects the format.
pub fn open_alignments(path: &Path) -> Result<bam::Reader> {
    bam::Reader::from_path(path).map_err(|e| anyhow!("Failed to open {}: {}", path.display(), e))
}

/// Writer carrying the header of `reader`, encoded like the `input` file.
pub fn writer_like(input: &Path, reader: &bam::Reader, output: &Path) -> Result<bam::Writer> {
    let format = if is_bam(input)? { bam::Format::Bam } else { bam::Format::Sam };
    let header = bam::Header::from_template(reader.header());
    bam::Writer::from_path(output, &header, format)
        .map_err(|e| anyhow!("Failed to create {}: {}", output.display(), e))
}

/// Unwraps one result of `Reader::records`. `index` is the 1-based record
/// number, header lines not counted.
pub fn decode(index: usize, result: Result<Record, rust_htslib::errors::Error>) -> Result<Record, PipelineError> {
    result.map_err(|e| PipelineError::InvalidSam { record: index, reason: e.to_string() })
}


#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct FilterCounts {
    pub kept: u64,
    pub dropped: u64,
}

fn filter_records(input: &Path, output: &Path, cutoff: u8) -> Result<FilterCounts> {
    let mut reader = open_alignments(input)?;
    let mut writer = writer_like(input, &reader, output)?;
    let mut counts = FilterCounts::default();

    for (i, result) in reader.records().enumerate() {
        let record = decode(i + 1, result)?;
        if record.mapq() >= cutoff {
            writer.write(&record)?;
            counts.kept += 1;
        } else {
            counts.dropped += 1;
        }
    }
    Ok(counts)
}

/// Copies `input` to `output`, keeping the header and every alignment whose
/// mapping quality is at least `cutoff`.
///
/// # Arguments
///
/// * `input` - SAM or BAM file to filter.
/// * `output` - Destination (truncated), written in the encoding of `input`.
/// * `cutoff` - Minimum MAPQ retained.
///
/// # Returns
/// Counts of kept and dropped alignments.
pub async fn filter_by_mapping_quality(input: &Path, output: &Path, cutoff: u8) -> Result<FilterCounts> {
    let (input, output) = (input.to_path_buf(), output.to_path_buf());
    tokio::task::spawn_blocking(move || filter_records(&input, &output, cutoff)).await?
}


/// Counts distinct read names that have at least one mapped alignment.
pub async fn count_mapped_reads(path: &Path) -> Result<u64> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<u64> {
        let mut reader = open_alignments(&path)?;
        let mut names: FxHashSet<Vec<u8>> = FxHashSet::default();
        for (i, result) in reader.records().enumerate() {
            let record = decode(i + 1, result)?;
            if !record.is_unmapped() {
                names.insert(record.qname().to_vec());
            }
        }
        Ok(names.len() as u64)
    })
    .await?
}
