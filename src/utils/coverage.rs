use std::path::Path;
use anyhow::{anyhow, Result};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

/// Name genomeCoverageBed gives its whole-genome summary rows.
const GENOME_ROW: &str = "genome";

#[derive(Debug, Clone, PartialEq)]
pub struct MeanCoverage {
    pub reference: String,
    pub mean: f64,
}

/// Reduces a genomeCoverageBed histogram (`chrom depth count size fraction`)
/// to one mean depth per reference sequence.
///
/// # Arguments
///
/// * `histogram` - genomeCoverageBed output without `-d`.
///
/// # Returns
/// One entry per contiguous reference block, in file order.
pub async fn mean_coverage(histogram: &Path) -> Result<Vec<MeanCoverage>> {
    let file = File::open(histogram)
        .await
        .map_err(|e| anyhow!("Failed to open {}: {}", histogram.display(), e))?;
    let mut lines = BufReader::new(file).lines();
    let mut means: Vec<MeanCoverage> = Vec::new();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 5 {
            return Err(anyhow!("{}:{}: expected 5 columns, found {}", histogram.display(), line_no, fields.len()));
        }
        if fields[0] == GENOME_ROW {
            continue;
        }
        let depth: f64 = fields[1]
            .parse()
            .map_err(|_| anyhow!("{}:{}: bad depth '{}'", histogram.display(), line_no, fields[1]))?;
        let fraction: f64 = fields[4]
            .parse()
            .map_err(|_| anyhow!("{}:{}: bad fraction '{}'", histogram.display(), line_no, fields[4]))?;

        match means.last_mut() {
            Some(last) if last.reference == fields[0] => last.mean += depth * fraction,
            _ => means.push(MeanCoverage {
                reference: fields[0].to_string(),
                mean: depth * fraction,
            }),
        }
    }
    Ok(means)
}


pub async fn write_mean_coverage(means: &[MeanCoverage], output: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(output).await?);
    for entry in means {
        writer.write_all(format!("{}\t{:.3}\n", entry.reference, entry.mean).as_bytes()).await?;
    }
    writer.flush().await?;
    Ok(())
}
