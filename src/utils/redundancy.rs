//! Detection of redundant alignments: reads placed equally well at more than
//! one location.
//!
//! Records are grouped into contiguous batches by read name. Inside a batch,
//! unpaired records, first mates and second mates are judged separately. The
//! best ranked record of a sub-group is the reference; the sub-group is
//! redundant when the aligner reported a next-best score (`XS`) equal to the
//! reference's own score (`AS`), and every record matching that score (and the
//! reference's mate score, if any) is emitted.

use std::cmp::Ordering;
use std::path::Path;
use anyhow::Result;
use fxhash::{hash64, FxHashSet};
use log::{debug, warn};
use rust_htslib::bam::Read;
use crate::utils::sambam::{decode, open_alignments, writer_like, AlignmentRecord};

/// Total order used to pick the reference record, best first.
///
/// Primary before secondary/supplementary, then higher MAPQ, `AS`, `XS` and
/// `YS`. An absent tag ranks below any value. Ties fall back to placement and
/// the encoded record.
pub fn rank(a: &AlignmentRecord, b: &AlignmentRecord) -> Ordering {
    a.is_secondary_or_supplementary()
        .cmp(&b.is_secondary_or_supplementary())
        .then_with(|| b.mapq.cmp(&a.mapq))
        .then_with(|| b.alignment_score.cmp(&a.alignment_score))
        .then_with(|| b.next_best_score.cmp(&a.next_best_score))
        .then_with(|| b.mate_score.cmp(&a.mate_score))
        .then_with(|| a.identity().cmp(&b.identity()))
}

/// Best record of a sub-group under [`rank`].
pub fn reference_record<'a>(records: &[&'a AlignmentRecord]) -> Option<&'a AlignmentRecord> {
    records.iter().copied().min_by(|a, b| rank(a, b))
}

/// Positions within `members` of the records to emit.
fn classify_subgroup(members: &[(usize, &AlignmentRecord)]) -> Vec<usize> {
    if members.len() < 2 {
        return Vec::new();
    }
    let records: Vec<&AlignmentRecord> = members.iter().map(|(_, r)| *r).collect();
    let Some(reference) = reference_record(&records) else {
        return Vec::new();
    };
    if reference.next_best_score.is_none() || reference.next_best_score != reference.alignment_score {
        return Vec::new();
    }

    let survivors: Vec<usize> = members
        .iter()
        .filter(|(_, r)| r.alignment_score == reference.alignment_score)
        .filter(|(_, r)| reference.mate_score.is_none() || r.mate_score == reference.mate_score)
        .map(|(i, _)| *i)
        .collect();

    if survivors.len() > 1 { survivors } else { Vec::new() }
}

/// Indices (ascending) of the redundant records in one batch.
///
/// # Arguments
///
/// * `batch` - Records sharing one read name, all carrying `AS`.
///
/// # Returns
/// Sorted indices into `batch`.
pub fn classify_batch(batch: &[AlignmentRecord]) -> Vec<usize> {
    let mut single = Vec::new();
    let mut first = Vec::new();
    let mut second = Vec::new();
    for (i, record) in batch.iter().enumerate() {
        match (record.is_paired(), record.is_first_of_pair()) {
            (false, _) => single.push((i, record)),
            (true, true) => first.push((i, record)),
            (true, false) => second.push((i, record)),
        }
    }

    let mut emitted: Vec<usize> = [single, first, second]
        .iter()
        .flat_map(|group| classify_subgroup(group))
        .collect();
    emitted.sort_unstable();
    emitted
}


#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ClassifierCounts {
    pub batches: u64,
    pub emitted: u64,
    /// Records dropped for lacking an `AS` tag.
    pub unscored: u64,
    /// Batches whose read name already closed an earlier batch.
    pub out_of_order: u64,
}

/// Streaming batcher. Records are pushed in file order; each call returns the
/// redundant records of any batch the push closed.
///
/// Out-of-order detection is approximate: it remembers a 64-bit hash of
/// every read name that opened a batch, one entry per distinct read for the
/// whole input, and a hash collision between two names is counted as a
/// repeat. The count only feeds a warning; batching never depends on it.
#[derive(Debug, Default)]
pub struct Classifier {
    current: Vec<AlignmentRecord>,
    seen: FxHashSet<u64>,
    counts: ClassifierCounts,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: AlignmentRecord) -> Vec<AlignmentRecord> {
        if record.alignment_score.is_none() {
            self.counts.unscored += 1;
            return Vec::new();
        }

        let mut emitted = Vec::new();
        if self.current.first().is_some_and(|r| r.read_name != record.read_name) {
            emitted = self.close_batch();
        }
        if self.current.is_empty() && !self.seen.insert(hash64(&record.read_name)) {
            debug!("Read {} reappears after its batch was closed", record.read_name);
            self.counts.out_of_order += 1;
        }
        self.current.push(record);
        emitted
    }

    /// Closes the last batch.
    pub fn finish(&mut self) -> Vec<AlignmentRecord> {
        self.close_batch()
    }

    pub fn counts(&self) -> ClassifierCounts {
        self.counts
    }

    fn close_batch(&mut self) -> Vec<AlignmentRecord> {
        let batch = std::mem::take(&mut self.current);
        if batch.is_empty() {
            return Vec::new();
        }
        self.counts.batches += 1;

        let keep = classify_batch(&batch);
        self.counts.emitted += keep.len() as u64;
        batch
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep.binary_search(i).is_ok())
            .map(|(_, r)| r)
            .collect()
    }
}


fn classify_file(input: &Path, output: &Path) -> Result<ClassifierCounts> {
    let mut reader = open_alignments(input)?;
    let mut writer = writer_like(input, &reader, output)?;
    let mut classifier = Classifier::new();

    for (i, result) in reader.records().enumerate() {
        let record = AlignmentRecord::from_record(decode(i + 1, result)?);
        for redundant in classifier.push(record) {
            writer.write(&redundant.record)?;
        }
    }
    for redundant in classifier.finish() {
        writer.write(&redundant.record)?;
    }
    Ok(classifier.counts())
}

/// Writes the header of `input` and every redundant alignment, in input
/// order, to `output`.
///
/// # Arguments
///
/// * `input` - SAM or BAM file grouped by read name (queryname order).
/// * `output` - Destination (truncated), written in the encoding of `input`.
///
/// # Returns
/// ClassifierCounts
pub async fn find_redundant_alignments(input: &Path, output: &Path) -> Result<ClassifierCounts> {
    let (source, target) = (input.to_path_buf(), output.to_path_buf());
    let counts = tokio::task::spawn_blocking(move || classify_file(&source, &target)).await??;

    if counts.out_of_order > 0 {
        warn!(
            "{} read batches in {} were not contiguous and were judged separately",
            counts.out_of_order,
            input.display()
        );
    }
    debug!(
        "Classified {} batches, {} redundant alignments, {} without AS",
        counts.batches, counts.emitted, counts.unscored
    );
    Ok(counts)
}
