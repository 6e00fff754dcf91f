use std::path::Path;
use anyhow::{anyhow, Result};
use seq_io::fasta::{Reader as FastaReader, Record};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use crate::utils::file::open_maybe_gzipped;

#[derive(Debug, Clone, PartialEq)]
pub struct GcContent {
    pub id: String,
    pub length: u64,
    /// G+C over sequence length, 0 for an empty sequence.
    pub gc: f64,
}


/// Counts G and C (either case) in a run of sequence bytes.
pub fn gc_count(seq: &[u8]) -> u64 {
    seq.iter().filter(|b| matches!(b, b'G' | b'g' | b'C' | b'c')).count() as u64
}


/// GC content of every record in a FASTA file, plain or gzipped.
///
/// # Arguments
///
/// * `path` - Reference FASTA.
///
/// # Returns
/// One GcContent per record, in file order.
pub fn gc_content(path: &Path) -> Result<Vec<GcContent>> {
    let reader = open_maybe_gzipped(path).map_err(|e| anyhow!("Failed to open {}: {}", path.display(), e))?;
    let mut fasta = FastaReader::new(reader);
    let mut contents = Vec::new();

    while let Some(result) = fasta.next() {
        let record = result?;
        let id = record.id().map_err(|e| anyhow!("Invalid FASTA header in {}: {}", path.display(), e))?;
        let (mut gc, mut length) = (0u64, 0u64);
        for line in record.seq_lines() {
            gc += gc_count(line);
            length += line.len() as u64;
        }
        contents.push(GcContent {
            id: id.to_string(),
            length,
            gc: if length == 0 { 0.0 } else { gc as f64 / length as f64 },
        });
    }
    Ok(contents)
}


pub async fn write_gc_content(contents: &[GcContent], output: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(output).await?);
    for entry in contents {
        writer.write_all(format!("{}\t{:.2}\n", entry.id, entry.gc).as_bytes()).await?;
    }
    writer.flush().await?;
    Ok(())
}
