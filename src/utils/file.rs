use std::fs::File;
use std::io;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use flate2::read::GzDecoder;
use tempfile::Builder;

/// Enum to hold either an uncompressed or gzipped file reader
pub enum FileReader {
    Uncompressed(BufReader<File>),
    Gzipped(GzDecoder<File>),
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileReader::Uncompressed(r) => r.read(buf),
            FileReader::Gzipped(r) => r.read(buf),
        }
    }
}

/// Opens `path`, transparently decompressing gzip input.
pub fn open_maybe_gzipped(path: &Path) -> io::Result<FileReader> {
    let gzipped = is_gzipped(path)?;
    let file = File::open(path)?;
    Ok(if gzipped {
        FileReader::Gzipped(GzDecoder::new(file))
    } else {
        FileReader::Uncompressed(BufReader::new(file))
    })
}

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}


/// Creates an empty, uniquely named file inside `dir` that outlives this call.
/// Every stage writes its output into one of these.
///
/// # Arguments
///
/// * `dir` - Directory that receives the file (the run's output directory).
/// * `prefix` - File name prefix, e.g. `sorted_`.
/// * `suffix` - File name suffix including the dot, e.g. `.bam`.
///
/// # Returns
/// Path of the created file.
pub fn temp_artifact(dir: &Path, prefix: &str, suffix: &str) -> io::Result<PathBuf> {
    let temp_path = Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(dir)?
        .into_temp_path();
    temp_path.keep().map_err(|e| e.error)
}


/// Returns the extension of `path` including the leading dot, or an empty string.
pub fn dotted_extension(path: &Path) -> String {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}


/// Appends `ext` to the full file name: `sorted.bam` + `bai` -> `sorted.bam.bai`.
pub fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}
