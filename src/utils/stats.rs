// Analysis of alignment tables produced by the pipeline (redundancy summaries)
use std::path::Path;
use anyhow::Result;
use fxhash::FxHashMap;
use rust_htslib::bam::Read;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use crate::utils::sambam::{decode, open_alignments};


/// count/sum/mean/min/max over a series of observations.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SummaryStats {
    pub count: u64,
    pub sum: u64,
    pub mean: f64,
    pub min: u64,
    pub max: u64,
}

impl SummaryStats {
    pub fn from_values(values: &[u64]) -> Self {
        if values.is_empty() {
            return SummaryStats::default();
        }
        let sum: u64 = values.iter().sum();
        SummaryStats {
            count: values.len() as u64,
            sum,
            mean: sum as f64 / values.len() as f64,
            min: values.iter().copied().min().unwrap_or(0),
            max: values.iter().copied().max().unwrap_or(0),
        }
    }
}


#[derive(Debug, Clone, PartialEq)]
pub struct RedundancyStats {
    /// Distinct reads with at least one redundant alignment, and how many each has.
    pub per_read: SummaryStats,
    pub mapped_reads: u64,
    /// Redundant reads over mapped reads.
    pub fraction_redundant: f64,
    /// Alignments per mapped read once redundant placements are counted.
    pub redundancy_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RedundancyReport {
    NoneFound,
    Found(RedundancyStats),
}


/// Combines per-read redundant alignment counts with the number of mapped
/// reads of the analysed alignment.
///
/// # Arguments
///
/// * `group_sizes` - Redundant alignments per read.
/// * `mapped_reads` - Distinct mapped read names in the analysed alignment.
///
/// # Returns
/// RedundancyReport
pub fn reduce_redundancy(group_sizes: &[u64], mapped_reads: u64) -> RedundancyReport {
    if group_sizes.is_empty() {
        return RedundancyReport::NoneFound;
    }
    let per_read = SummaryStats::from_values(group_sizes);
    let (fraction_redundant, redundancy_rate) = if mapped_reads == 0 {
        (0.0, 0.0)
    } else {
        let mapped = mapped_reads as f64;
        let groups = per_read.count as f64;
        (groups / mapped, ((mapped - groups) + per_read.sum as f64) / mapped)
    };
    RedundancyReport::Found(RedundancyStats {
        per_read,
        mapped_reads,
        fraction_redundant,
        redundancy_rate,
    })
}


/// Counts alignments per read name in a SAM or BAM file, in first-seen order.
pub async fn alignments_per_read(path: &Path) -> Result<Vec<u64>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Vec<u64>> {
        let mut reader = open_alignments(&path)?;
        let mut index: FxHashMap<Vec<u8>, usize> = FxHashMap::default();
        let mut counts: Vec<u64> = Vec::new();

        for (i, result) in reader.records().enumerate() {
            let record = decode(i + 1, result)?;
            let next = counts.len();
            let slot = *index.entry(record.qname().to_vec()).or_insert(next);
            if slot == next {
                counts.push(0);
            }
            counts[slot] += 1;
        }
        Ok(counts)
    })
    .await?
}


pub fn format_redundancy_stats(stats: &RedundancyStats) -> String {
    let mut text = String::new();
    text.push_str("Overall:\n");
    text.push_str(&format!(
        "Redundant alignments: {} ({:.2}%)\n",
        stats.per_read.count,
        stats.fraction_redundant * 100.0
    ));
    text.push_str(&format!("Redundant alignment rate: {:.2}\n", stats.redundancy_rate));
    text.push('\n');
    text.push_str("Redundant alignments:\n");
    text.push_str(&format!("Average redundancy: {:.2}\n", stats.per_read.mean));
    text.push_str(&format!("Minimum number of redundant alignments: {}\n", stats.per_read.min));
    text.push_str(&format!("Maximum number of redundant alignments: {}\n", stats.per_read.max));
    text
}


pub async fn write_redundancy_stats(stats: &RedundancyStats, path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path).await?);
    writer.write_all(format_redundancy_stats(stats).as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
