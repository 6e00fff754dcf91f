use std::collections::HashMap;
use std::path::{Path, PathBuf};
use lazy_static::lazy_static;
use thiserror::Error;
use crate::cli::Arguments;

// External software
pub const BOWTIE2_TAG: &str = "bowtie2";
pub const BOWTIE2_BUILD_TAG: &str = "bowtie2-build";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const PICARD_TAG: &str = "picard";
pub const JAVA_TAG: &str = "java";
pub const PICARD_JAR: &str = "picard.jar";
pub const GENOME_COVERAGE_BED_TAG: &str = "genomeCoverageBed";
pub const BEDTOOLS_TAG: &str = "bedtools";


lazy_static! {
    /// Oldest (major, minor) release of each tool the argument generators are written against.
    pub static ref TOOL_VERSIONS: HashMap<&'static str, (u32, u32)> = {
        let mut m = HashMap::new();
        m.insert(SAMTOOLS_TAG, (1, 9));
        m.insert(BOWTIE2_TAG, (2, 3));
        m.insert(BEDTOOLS_TAG, (2, 26));
        m
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    Faidx,
    View,
    Sort,
    Index,
}

impl SamtoolsSubcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamtoolsSubcommand::Faidx => "faidx",
            SamtoolsSubcommand::View => "view",
            SamtoolsSubcommand::Sort => "sort",
            SamtoolsSubcommand::Index => "index",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PicardSubcommand {
    MergeSamFiles,
    MarkDuplicates,
}

impl PicardSubcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            PicardSubcommand::MergeSamFiles => "MergeSamFiles",
            PicardSubcommand::MarkDuplicates => "MarkDuplicates",
        }
    }
}

// Tool log files, written inside the output directory
pub const BOWTIE2_LOG: &str = "bowtie2.log";
pub const SAMTOOLS_LOG: &str = "samtools.log";
pub const PICARD_LOG: &str = "picard.log";
pub const BEDTOOLS_LOG: &str = "bedtools.log";

// Published names
pub const CLEAN_ALIGNMENT: &str = "clean_alignment";
pub const MEAN_COVERAGE: &str = "mean.coverage";
pub const MAP_COVERAGE: &str = "map.coverage";
pub const REDUNDANCY_STATS: &str = "redundancy.stats";
pub const REDUNDANCY_ALIGNMENTS: &str = "redundancy_alignments";
pub const REDUNDANCY_MEAN_COVERAGE: &str = "redundancy_mean.coverage";
pub const REDUNDANCY_MAP_COVERAGE: &str = "redundancy_map.coverage";
pub const REMOVE_DUPLICATES_METRICS: &str = "remove_duplicates.metrics";
pub const GC_REFERENCE: &str = "gc_reference.tsv";

// Temp artifact prefixes and suffixes
pub const ARCHIVE_DIR_PREFIX: &str = "tmp";
pub const PAIRED_PREFIX: &str = "paired_";
pub const SINGLE_PREFIX: &str = "single_";
pub const MERGED_PREFIX: &str = "merged_";
pub const QUALITY_PREFIX: &str = "quality_";
pub const MARKDUPLICATES_PREFIX: &str = "markduplicates_";
pub const REDUNDANT_PREFIX: &str = "redundant_";
pub const VIEW_PREFIX: &str = "view_";
pub const SORTED_PREFIX: &str = "sorted_";
pub const HISTOGRAM_PREFIX: &str = "map_";
pub const PER_BASE_PREFIX: &str = "perbase_";
pub const MEAN_PREFIX: &str = "mean_";
pub const REDUNDANCY_PREFIX: &str = "redundancy_";
pub const GC_PREFIX: &str = "gc_";
pub const SAM_SUFFIX: &str = ".sam";
pub const BAM_SUFFIX: &str = ".bam";
pub const COVERAGE_SUFFIX: &str = ".coverage";
pub const METRICS_SUFFIX: &str = ".metrics";

// Static Parameters
pub const BOWTIE2_INDEX_SUFFIX: &str = ".1.bt2";
pub const FAIDX_EXT: &str = "fai";
pub const BAM_INDEX_EXT: &str = "bai";
pub const METRICS_EXT: &str = "metrics";
pub const SECONDARY_OR_SUPPLEMENTARY_MASK: &str = "0x900";
pub const QUERYNAME_SORT_ORDER: &str = "queryname";


/// Which read files were supplied. Any other combination is rejected while
/// building the [`RunConfig`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReadInputs {
    Single(PathBuf),
    Paired { forward: PathBuf, reverse: PathBuf },
    PairedAndSingle { forward: PathBuf, reverse: PathBuf, single: PathBuf },
}

/// Program locations, overridable from the command line.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub bowtie2: String,
    pub bowtie2_build: String,
    pub samtools: String,
    pub java: String,
    pub picard_jar: String,
    pub genome_coverage_bed: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        ToolPaths {
            bowtie2: BOWTIE2_TAG.to_string(),
            bowtie2_build: BOWTIE2_BUILD_TAG.to_string(),
            samtools: SAMTOOLS_TAG.to_string(),
            java: JAVA_TAG.to_string(),
            picard_jar: PICARD_JAR.to_string(),
            genome_coverage_bed: GENOME_COVERAGE_BED_TAG.to_string(),
        }
    }
}

/// Immutable, run-scoped settings. Built once in `main` and shared by reference.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub cwd: PathBuf,
    pub out_dir: PathBuf,
    pub reference: PathBuf,
    pub reads: ReadInputs,
    pub tools: ToolPaths,
    pub threads: usize,
    pub verbose: bool,
    pub keep_temp: bool,
    pub quality_cutoff: Option<u8>,
    pub redundancy: bool,
    pub mean_coverage: bool,
    pub coverage_map: bool,
    pub gc_content: bool,
    pub force_rebuild: bool,
}

impl RunConfig {
    /// Resolves the parsed arguments against `cwd` and validates the read
    /// input combination.
    ///
    /// # Arguments
    ///
    /// * `args` - Parsed command-line arguments.
    /// * `cwd` - Working directory used for relative paths.
    /// * `threads` - Thread count to use when none was requested.
    ///
    /// # Returns
    /// RunConfig, or PipelineError::InvalidConfig for unusable input.
    pub fn from_args(args: &Arguments, cwd: &Path, threads: usize) -> Result<Self, PipelineError> {
        let resolve = |p: &str| -> PathBuf {
            let path = PathBuf::from(p);
            if path.is_absolute() { path } else { cwd.join(path) }
        };

        let reads = read_inputs(
            args.forward.as_deref().map(resolve),
            args.reverse.as_deref().map(resolve),
            args.single.as_deref().map(resolve),
        )?;

        let quality_cutoff = match args.filter_qual {
            q if q < 0 => None,
            q => Some(u8::try_from(q).map_err(|_| {
                PipelineError::InvalidConfig(format!("Quality cutoff {} is above the MAPQ range (0-255)", q))
            })?),
        };

        let tools = ToolPaths {
            bowtie2: args.bowtie2.clone(),
            bowtie2_build: args.bowtie2_build.clone(),
            samtools: args.samtools.clone(),
            java: args.java.clone(),
            picard_jar: args.picard.clone(),
            genome_coverage_bed: args.genome_coverage_bed.clone(),
        };

        Ok(RunConfig {
            cwd: cwd.to_path_buf(),
            out_dir: resolve(&args.out_dir),
            reference: resolve(&args.reference),
            reads,
            tools,
            threads: args.threads.unwrap_or(threads).max(1),
            verbose: args.verbose,
            keep_temp: args.keep_tmp,
            quality_cutoff,
            redundancy: args.redundancy,
            mean_coverage: args.mean_cov,
            coverage_map: args.cov_map,
            gc_content: args.gc_count,
            force_rebuild: args.force_rebuild,
        })
    }

    pub fn tool_log(&self, name: &str) -> PathBuf {
        self.out_dir.join(name)
    }
}

/// Maps the supplied read files onto one of the three accepted layouts.
pub fn read_inputs(
    forward: Option<PathBuf>,
    reverse: Option<PathBuf>,
    single: Option<PathBuf>,
) -> Result<ReadInputs, PipelineError> {
    match (forward, reverse, single) {
        (None, None, Some(single)) => Ok(ReadInputs::Single(single)),
        (Some(forward), Some(reverse), None) => Ok(ReadInputs::Paired { forward, reverse }),
        (Some(forward), Some(reverse), Some(single)) => Ok(ReadInputs::PairedAndSingle { forward, reverse, single }),
        (None, None, None) => Err(PipelineError::InvalidConfig(
            "At least a single read file or a forward/reverse pair is required".to_string(),
        )),
        _ => Err(PipelineError::InvalidConfig(
            "Forward (-1) and reverse (-2) read files must be given together".to_string(),
        )),
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{tool} failed: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("I/O error: {0}")]
    IOError(String),

    #[error("Malformed alignment record {record}: {reason}")]
    InvalidSam { record: usize, reason: String },

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn tool(tool: &str, error: impl std::fmt::Display) -> Self {
        PipelineError::ToolExecution {
            tool: tool.to_string(),
            error: error.to_string(),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}
