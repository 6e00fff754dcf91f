use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::Result;
use log::{debug, error, info, warn};
use crate::config::defs::{
    PipelineError, ReadInputs, RunConfig, BAM_INDEX_EXT, BAM_SUFFIX, BEDTOOLS_LOG, BEDTOOLS_TAG,
    BOWTIE2_BUILD_TAG, BOWTIE2_LOG, BOWTIE2_TAG, CLEAN_ALIGNMENT, COVERAGE_SUFFIX, FAIDX_EXT,
    GC_PREFIX, GC_REFERENCE, HISTOGRAM_PREFIX, MAP_COVERAGE, MARKDUPLICATES_PREFIX, MEAN_COVERAGE,
    MEAN_PREFIX, MERGED_PREFIX, METRICS_EXT, METRICS_SUFFIX, PAIRED_PREFIX, PER_BASE_PREFIX,
    PICARD_LOG, PICARD_TAG, QUALITY_PREFIX, QUERYNAME_SORT_ORDER, REDUNDANCY_ALIGNMENTS,
    REDUNDANCY_MAP_COVERAGE, REDUNDANCY_MEAN_COVERAGE, REDUNDANCY_PREFIX, REDUNDANCY_STATS,
    REDUNDANT_PREFIX, REMOVE_DUPLICATES_METRICS, SAMTOOLS_LOG, SAMTOOLS_TAG, SAM_SUFFIX,
    SECONDARY_OR_SUPPLEMENTARY_MASK, SINGLE_PREFIX, SORTED_PREFIX, VIEW_PREFIX,
};
use crate::utils::command::{bedtools, bowtie2, picard, samtools};
use crate::utils::coverage::{mean_coverage, write_mean_coverage};
use crate::utils::fastx::{gc_content, write_gc_content};
use crate::utils::file::{append_extension, dotted_extension, temp_artifact};
use crate::utils::ledger::Ledger;
use crate::utils::process::{Invocation, ProcessRunner, StageRunner};
use crate::utils::redundancy::find_redundant_alignments;
use crate::utils::sambam::{alignment_suffix, count_mapped_reads, filter_by_mapping_quality};
use crate::utils::stats::{alignments_per_read, reduce_redundancy, write_redundancy_stats, RedundancyReport, RedundancyStats};

/// What a finished run left behind.
#[derive(Debug)]
pub struct RunSummary {
    /// Published artifacts under their final names (or their original name
    /// when the rename failed).
    pub published: Vec<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    /// `None` when redundancy analysis was not requested or could not run.
    pub redundancy: Option<RedundancyReport>,
    pub cleanup_failures: usize,
}

/// Which alignment the reference-order stages are preparing.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SortTarget {
    /// The main alignment: secondary and supplementary records are removed.
    Main,
    /// The redundant subset: everything is kept. A failed sort still ends
    /// the run.
    Redundant,
}

struct Pipeline<'a, R: StageRunner> {
    config: &'a RunConfig,
    runner: &'a R,
    ledger: Ledger,
    faidx: Option<PathBuf>,
}


/// Deletes a partially written stage output. Missing files are fine.
fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed partial output {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Cannot remove partial output {}: {}", path.display(), e),
    }
}


async fn reference_gc(reference: PathBuf, output: &Path) -> Result<usize> {
    let contents = tokio::task::spawn_blocking(move || gc_content(&reference)).await??;
    write_gc_content(&contents, output).await?;
    Ok(contents.len())
}


impl<'a, R: StageRunner> Pipeline<'a, R> {
    fn new(config: &'a RunConfig, runner: &'a R) -> Self {
        Pipeline {
            config,
            runner,
            ledger: Ledger::new(&config.out_dir),
            faidx: None,
        }
    }

    fn fresh(&self, prefix: &str, suffix: &str) -> Result<PathBuf, PipelineError> {
        temp_artifact(&self.config.out_dir, prefix, suffix).map_err(|e| {
            PipelineError::IOError(format!(
                "Cannot create {}*{} in {}: {}",
                prefix,
                suffix,
                self.config.out_dir.display(),
                e
            ))
        })
    }

    /// Runs one external command. On a nonzero exit or a failed launch every
    /// path in `outputs` is removed before the failure is returned.
    async fn stage(&self, tool: &str, invocation: Invocation, outputs: &[&Path]) -> Result<(), PipelineError> {
        let failure = match self.runner.invoke(&invocation).await {
            Ok(0) => return Ok(()),
            Ok(code) => PipelineError::tool(
                tool,
                format!("exit status {}, see {}", code, invocation.log_path.display()),
            ),
            Err(e) => PipelineError::tool(tool, e),
        };
        for output in outputs {
            remove_partial(output);
        }
        Err(failure)
    }

    async fn execute(&mut self) -> Result<Option<RedundancyReport>, PipelineError> {
        self.build_index().await?;
        self.reference_faidx().await;
        if self.config.gc_content {
            self.gc_content().await;
        }

        let mut alignment = self.map().await?;
        if let Some(cutoff) = self.config.quality_cutoff {
            alignment = self.quality_filter(alignment, cutoff).await;
        }
        alignment = self.remove_duplicates(alignment).await;

        let redundancy = if self.config.redundancy {
            self.redundancy(&alignment).await?
        } else {
            None
        };

        let sorted = self
            .sort_and_index(&alignment, SortTarget::Main)
            .await
            .map_err(|e| PipelineError::Fatal(format!("Cannot sort alignments, see {}: {}", SAMTOOLS_LOG, e)))?;
        self.ledger.publish(&sorted, &format!("{}{}", CLEAN_ALIGNMENT, dotted_extension(&sorted)));

        self.coverage(&sorted, MEAN_COVERAGE, MAP_COVERAGE).await;
        Ok(redundancy)
    }

    async fn build_index(&mut self) -> Result<(), PipelineError> {
        let config = self.config;
        if !config.force_rebuild && bowtie2::index_exists(&config.reference) {
            info!("Bowtie2 index found for {}, skipping build", config.reference.display());
            return Ok(());
        }

        info!("Building Bowtie2 index for {}", config.reference.display());
        let invocation = Invocation::new(
            &config.tools.bowtie2_build,
            bowtie2::build_arg_generator(&config.reference),
            &config.tool_log(BOWTIE2_LOG),
        );
        self.stage(BOWTIE2_BUILD_TAG, invocation, &[])
            .await
            .map_err(|e| PipelineError::Fatal(format!("Cannot build reference index: {}", e)))
    }

    async fn reference_faidx(&mut self) {
        let config = self.config;
        let fai = append_extension(&config.reference, FAIDX_EXT);
        // A user's existing index is neither removed on failure nor cleaned up.
        let existed = fai.exists();
        let outputs: Vec<&Path> = if existed { Vec::new() } else { vec![fai.as_path()] };

        let invocation = Invocation::new(
            &config.tools.samtools,
            samtools::faidx_arg_generator(&config.reference),
            &config.tool_log(SAMTOOLS_LOG),
        );
        match self.stage(SAMTOOLS_TAG, invocation, &outputs).await {
            Ok(()) => {
                if !existed {
                    self.ledger.track(&fai);
                }
                self.faidx = Some(fai);
            }
            Err(e) => warn!("Cannot index reference, reference layout will come from the alignment header: {}", e),
        }
    }

    async fn gc_content(&mut self) {
        info!("Calculating GC content for reference sequences");
        let output = match self.fresh(GC_PREFIX, METRICS_SUFFIX) {
            Ok(path) => path,
            Err(e) => {
                warn!("Cannot compute GC content: {}", e);
                return;
            }
        };
        match reference_gc(self.config.reference.clone(), &output).await {
            Ok(records) => {
                debug!("GC content computed for {} sequences", records);
                self.ledger.publish(&output, GC_REFERENCE);
            }
            Err(e) => {
                remove_partial(&output);
                warn!("Cannot compute GC content: {}", e);
            }
        }
    }

    async fn map(&mut self) -> Result<PathBuf, PipelineError> {
        let config = self.config;
        info!("Start mapping");

        let alignment = match &config.reads {
            ReadInputs::Single(single) => {
                info!("Single reads: {}", single.display());
                self.map_single(single).await
            }
            ReadInputs::Paired { forward, reverse } => {
                info!("Forward reads: {}", forward.display());
                info!("Reverse reads: {}", reverse.display());
                self.map_paired(forward, reverse).await
            }
            ReadInputs::PairedAndSingle { forward, reverse, single } => {
                info!("Forward reads: {}", forward.display());
                info!("Reverse reads: {}", reverse.display());
                info!("Single reads: {}", single.display());
                let single_map = self.map_single(single).await;
                let paired_map = self.map_paired(forward, reverse).await;

                match (paired_map, single_map) {
                    (Some(paired), Some(single)) => {
                        info!("Merging paired and single alignments");
                        match self.merge(&paired, &single).await {
                            Some(merged) => Some(merged),
                            None => {
                                warn!("Problems merging paired and single alignments, using only paired alignments");
                                Some(paired)
                            }
                        }
                    }
                    (Some(paired), None) => {
                        warn!("Problems mapping single reads, using only paired alignments");
                        Some(paired)
                    }
                    (None, Some(single)) => {
                        warn!("Problems mapping paired reads, using only single alignments");
                        Some(single)
                    }
                    (None, None) => None,
                }
            }
        };

        alignment.ok_or_else(|| {
            PipelineError::Fatal(format!("Cannot map reads to the reference, see {} for details", BOWTIE2_LOG))
        })
    }

    async fn bowtie2_map(&mut self, prefix: &str, args: impl FnOnce(&Path) -> Vec<String>) -> Option<PathBuf> {
        let config = self.config;
        let output = match self.fresh(prefix, SAM_SUFFIX) {
            Ok(path) => path,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };
        let invocation = Invocation::new(&config.tools.bowtie2, args(&output), &config.tool_log(BOWTIE2_LOG));
        match self.stage(BOWTIE2_TAG, invocation, &[&output]).await {
            Ok(()) => {
                self.ledger.track(&output);
                Some(output)
            }
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    async fn map_single(&mut self, single: &Path) -> Option<PathBuf> {
        let config = self.config;
        self.bowtie2_map(SINGLE_PREFIX, |output| bowtie2::single_end_arg_generator(config, single, output))
            .await
    }

    async fn map_paired(&mut self, forward: &Path, reverse: &Path) -> Option<PathBuf> {
        let config = self.config;
        self.bowtie2_map(PAIRED_PREFIX, |output| {
            bowtie2::paired_end_arg_generator(config, forward, reverse, output)
        })
        .await
    }

    async fn merge(&mut self, paired: &Path, single: &Path) -> Option<PathBuf> {
        let config = self.config;
        let output = match self.fresh(MERGED_PREFIX, SAM_SUFFIX) {
            Ok(path) => path,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };
        let invocation = Invocation::new(
            &config.tools.java,
            picard::merge_arg_generator(&config.tools.picard_jar, &[paired, single], &output),
            &config.tool_log(PICARD_LOG),
        );
        match self.stage(PICARD_TAG, invocation, &[&output]).await {
            Ok(()) => {
                self.ledger.track(&output);
                Some(output)
            }
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    async fn quality_filter(&mut self, alignment: PathBuf, cutoff: u8) -> PathBuf {
        info!("Filtering out low quality alignments (quality cutoff = {})", cutoff);
        let output = match alignment_suffix(&alignment)
            .map_err(PipelineError::from)
            .and_then(|suffix| self.fresh(QUALITY_PREFIX, suffix))
        {
            Ok(path) => path,
            Err(e) => {
                warn!("Cannot filter records based on mapping quality: {}", e);
                return alignment;
            }
        };
        match filter_by_mapping_quality(&alignment, &output, cutoff).await {
            Ok(counts) => {
                info!("Kept {} alignments, dropped {} below quality {}", counts.kept, counts.dropped, cutoff);
                self.ledger.track(&output);
                output
            }
            Err(e) => {
                remove_partial(&output);
                warn!("Cannot filter records based on mapping quality: {}", e);
                alignment
            }
        }
    }

    async fn remove_duplicates(&mut self, alignment: PathBuf) -> PathBuf {
        let config = self.config;
        info!("Removing duplicated reads from alignment");
        let output = match self.fresh(MARKDUPLICATES_PREFIX, &dotted_extension(&alignment)) {
            Ok(path) => path,
            Err(e) => {
                warn!("Duplicates were not removed: {}", e);
                return alignment;
            }
        };
        let metrics = output.with_extension(METRICS_EXT);

        let invocation = Invocation::new(
            &config.tools.java,
            picard::mark_duplicates_arg_generator(
                &config.tools.picard_jar,
                &alignment,
                &output,
                &metrics,
                QUERYNAME_SORT_ORDER,
            ),
            &config.tool_log(PICARD_LOG),
        );
        match self.stage(PICARD_TAG, invocation, &[&output, &metrics]).await {
            Ok(()) => {
                self.ledger.track(&output);
                if metrics.exists() {
                    self.ledger.publish(&metrics, REMOVE_DUPLICATES_METRICS);
                } else {
                    warn!("MarkDuplicates wrote no metrics file");
                }
                output
            }
            Err(e) => {
                warn!("Duplicates were not removed due to errors, see {}: {}", PICARD_LOG, e);
                alignment
            }
        }
    }

    /// Classifies redundant alignments, writes their statistics and runs the
    /// reference-order and coverage stages over them. Only a failed sort of
    /// the redundant subset is fatal.
    async fn redundancy(&mut self, alignment: &Path) -> Result<Option<RedundancyReport>, PipelineError> {
        info!("Estimating redundancy");
        let redundant = match alignment_suffix(alignment)
            .map_err(PipelineError::from)
            .and_then(|suffix| self.fresh(REDUNDANT_PREFIX, suffix))
        {
            Ok(path) => path,
            Err(e) => {
                warn!("Cannot estimate redundancy: {}", e);
                return Ok(None);
            }
        };
        let counts = match find_redundant_alignments(alignment, &redundant).await {
            Ok(counts) => counts,
            Err(e) => {
                remove_partial(&redundant);
                warn!("Cannot estimate redundancy, redundancy file will not be reported: {}", e);
                return Ok(None);
            }
        };
        self.ledger.track(&redundant);
        debug!("{} redundant alignments in {} read batches", counts.emitted, counts.batches);

        let group_sizes = match alignments_per_read(&redundant).await {
            Ok(sizes) => sizes,
            Err(e) => {
                warn!("Cannot read redundant alignments: {}", e);
                return Ok(None);
            }
        };
        if group_sizes.is_empty() {
            info!("No redundant alignment was found");
            return Ok(Some(RedundancyReport::NoneFound));
        }

        let mapped = match count_mapped_reads(alignment).await {
            Ok(mapped) => mapped,
            Err(e) => {
                warn!("Cannot count mapped reads: {}", e);
                return Ok(None);
            }
        };
        let report = reduce_redundancy(&group_sizes, mapped);
        if let RedundancyReport::Found(stats) = &report {
            self.write_redundancy_stats(stats).await;
        }

        info!("Indexing and sorting redundant alignment file");
        let sorted = self
            .sort_and_index(&redundant, SortTarget::Redundant)
            .await
            .map_err(|e| PipelineError::Fatal(format!("Cannot sort redundant alignments, see {}: {}", SAMTOOLS_LOG, e)))?;
        self.ledger
            .publish(&sorted, &format!("{}{}", REDUNDANCY_ALIGNMENTS, dotted_extension(&sorted)));
        self.coverage(&sorted, REDUNDANCY_MEAN_COVERAGE, REDUNDANCY_MAP_COVERAGE).await;
        Ok(Some(report))
    }

    async fn write_redundancy_stats(&mut self, stats: &RedundancyStats) {
        info!("Writing redundancy stats");
        let output = match self.fresh(REDUNDANCY_PREFIX, METRICS_SUFFIX) {
            Ok(path) => path,
            Err(e) => {
                warn!("Cannot write redundancy stats: {}", e);
                return;
            }
        };
        match write_redundancy_stats(stats, &output).await {
            Ok(()) => self.ledger.publish(&output, REDUNDANCY_STATS),
            Err(e) => {
                remove_partial(&output);
                warn!("Cannot write redundancy stats: {}", e);
            }
        }
    }

    async fn view(&mut self, alignment: &Path, exclude_flags: Option<&str>) -> Option<PathBuf> {
        let config = self.config;
        let output = match self.fresh(VIEW_PREFIX, BAM_SUFFIX) {
            Ok(path) => path,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };
        let invocation = Invocation::new(
            &config.tools.samtools,
            samtools::view_arg_generator(self.faidx.as_deref(), alignment, &output, exclude_flags),
            &config.tool_log(SAMTOOLS_LOG),
        );
        match self.stage(SAMTOOLS_TAG, invocation, &[&output]).await {
            Ok(()) => {
                self.ledger.track(&output);
                Some(output)
            }
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    /// BAM conversion, coordinate sort and BAM index. Returns the sorted BAM;
    /// the caller decides whether a sort failure ends the run.
    async fn sort_and_index(&mut self, alignment: &Path, target: SortTarget) -> Result<PathBuf, PipelineError> {
        let config = self.config;
        let exclude_flags = match target {
            SortTarget::Main => {
                info!("Removing secondary and supplementary alignments and ordering by reference");
                Some(SECONDARY_OR_SUPPLEMENTARY_MASK)
            }
            SortTarget::Redundant => {
                info!("Ordering by reference");
                None
            }
        };

        let bam = match self.view(alignment, exclude_flags).await {
            Some(bam) => bam,
            None => {
                match target {
                    SortTarget::Main => warn!("Cannot remove secondary and supplementary alignments, coverage could be overestimated"),
                    SortTarget::Redundant => warn!("Cannot determine sort order based on reference"),
                }
                alignment.to_path_buf()
            }
        };

        info!("Sorting and indexing");
        let sorted = self.fresh(SORTED_PREFIX, BAM_SUFFIX)?;
        let invocation = Invocation::new(
            &config.tools.samtools,
            samtools::sort_arg_generator(&bam, &sorted),
            &config.tool_log(SAMTOOLS_LOG),
        );
        self.stage(SAMTOOLS_TAG, invocation, &[&sorted]).await?;
        self.ledger.track(&sorted);

        let bai = append_extension(&sorted, BAM_INDEX_EXT);
        let invocation = Invocation::new(
            &config.tools.samtools,
            samtools::index_arg_generator(&sorted),
            &config.tool_log(SAMTOOLS_LOG),
        );
        match self.stage(SAMTOOLS_TAG, invocation, &[&bai]).await {
            Ok(()) => self.ledger.track(&bai),
            Err(e) => warn!("Problems indexing alignments, continuing without an index: {}", e),
        }
        Ok(sorted)
    }

    async fn coverage(&mut self, sorted: &Path, mean_name: &str, map_name: &str) {
        if self.config.mean_coverage {
            if let Some(mean) = self.estimate_mean_coverage(sorted).await {
                self.ledger.publish(&mean, mean_name);
            }
        }
        if self.config.coverage_map {
            if let Some(map) = self.estimate_per_base_coverage(sorted).await {
                self.ledger.publish(&map, map_name);
            }
        }
    }

    /// genomeCoverageBed invocation whose stdout becomes a fresh temp file.
    async fn genome_coverage(&mut self, sorted: &Path, prefix: &str, per_base: bool) -> Option<PathBuf> {
        let config = self.config;
        let output = match self.fresh(prefix, COVERAGE_SUFFIX) {
            Ok(path) => path,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };
        let invocation = Invocation::new(
            &config.tools.genome_coverage_bed,
            bedtools::genome_coverage_arg_generator(sorted, per_base),
            &config.tool_log(BEDTOOLS_LOG),
        )
        .stdout_to(&output);
        match self.stage(BEDTOOLS_TAG, invocation, &[&output]).await {
            Ok(()) => Some(output),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    async fn estimate_mean_coverage(&mut self, sorted: &Path) -> Option<PathBuf> {
        info!("Estimating mean coverage of {}", sorted.display());
        let histogram = self.genome_coverage(sorted, HISTOGRAM_PREFIX, false).await?;
        self.ledger.track(&histogram);

        let output = match self.fresh(MEAN_PREFIX, COVERAGE_SUFFIX) {
            Ok(path) => path,
            Err(e) => {
                warn!("Cannot estimate mean coverage: {}", e);
                return None;
            }
        };
        let result = match mean_coverage(&histogram).await {
            Ok(means) => write_mean_coverage(&means, &output).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Some(output),
            Err(e) => {
                remove_partial(&output);
                warn!("Cannot estimate mean coverage: {}", e);
                None
            }
        }
    }

    async fn estimate_per_base_coverage(&mut self, sorted: &Path) -> Option<PathBuf> {
        info!("Estimating per-base coverage of {}", sorted.display());
        self.genome_coverage(sorted, PER_BASE_PREFIX, true).await
    }
}


/// Runs the whole analysis with any [`StageRunner`]. Temporary artifacts are
/// resolved before returning, fatal errors included.
///
/// # Arguments
///
/// * `config` - RunConfig built in main.
/// * `runner` - Launches the external tools.
///
/// # Returns
/// RunSummary, or the fatal PipelineError.
pub async fn run_with_runner<R: StageRunner>(config: &RunConfig, runner: &R) -> Result<RunSummary, PipelineError> {
    let mut pipeline = Pipeline::new(config, runner);
    let outcome = pipeline.execute().await;
    if let Err(e) = &outcome {
        error!("{}", e);
    }

    let report = pipeline.ledger.finalize(config.keep_temp);
    if report.failures > 0 {
        warn!("{} files could not be cleaned up or renamed", report.failures);
    }

    let redundancy = outcome?;
    Ok(RunSummary {
        published: report.published,
        archive_dir: report.archive_dir,
        redundancy,
        cleanup_failures: report.failures,
    })
}


/// Run function for the mapping and coverage pipeline
///
/// # Arguments
///
/// * `config` - RunConfig struct from main.
///
/// # Returns
/// Result<RunSummary, PipelineError>
pub async fn run(config: Arc<RunConfig>) -> Result<RunSummary, PipelineError> {
    let runner = ProcessRunner::new(config.verbose);
    run_with_runner(&config, &runner).await
}
