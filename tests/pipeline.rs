use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use tempfile::{tempdir, TempDir};

use mapcov::config::defs::{PipelineError, ReadInputs, RunConfig, ToolPaths};
use mapcov::pipelines::coverage_analysis::run_with_runner;
use mapcov::utils::process::{Capture, Invocation, StageRunner};
use mapcov::utils::stats::RedundancyReport;

const SAM: &str = "\
@HD\tVN:1.6\tSO:queryname
@SQ\tSN:chr1\tLN:1000
r1\t0\tchr1\t100\t1\t4M\t*\t0\t0\tACGT\tIIII\tAS:i:10\tXS:i:10
r1\t256\tchr1\t200\t1\t4M\t*\t0\t0\tACGT\tIIII\tAS:i:10\tXS:i:10
r1\t256\tchr1\t300\t1\t4M\t*\t0\t0\tACGT\tIIII\tAS:i:7
r2\t0\tchr1\t10\t42\t4M\t*\t0\t0\tACGT\tIIII\tAS:i:0
r3\t4\t*\t0\t0\t*\t*\t0\t0\tACGT\tIIII
";

const HISTOGRAM: &str = "\
chr1\t0\t1\t4\t0.25
chr1\t2\t3\t4\t0.75
genome\t0\t1\t4\t0.25
genome\t2\t3\t4\t0.75
";

const PER_BASE: &str = "chr1\t1\t0\nchr1\t2\t2\nchr1\t3\t2\nchr1\t4\t2\n";

type FailWhen = Box<dyn Fn(&Invocation) -> bool + Send + Sync>;

/// Stands in for the external tools: records every invocation and writes
/// plausible outputs, or exits 1 when `fail` matches.
struct FakeRunner {
    calls: Mutex<Vec<Invocation>>,
    fail: FailWhen,
}

impl FakeRunner {
    fn new() -> Self {
        Self::failing(|_| false)
    }

    fn failing(fail: impl Fn(&Invocation) -> bool + Send + Sync + 'static) -> Self {
        FakeRunner {
            calls: Mutex::new(Vec::new()),
            fail: Box::new(fail),
        }
    }

    fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }
}

fn after<'a>(args: &[&'a str], flag: &str) -> &'a str {
    let at = args.iter().position(|a| *a == flag).expect("flag present");
    args[at + 1]
}

fn keyed<'a>(args: &[&'a str], key: &str) -> &'a str {
    args.iter().find_map(|a| a.strip_prefix(key)).expect("key present")
}

fn produce_outputs(invocation: &Invocation) -> io::Result<()> {
    let args: Vec<&str> = invocation.args.iter().map(String::as_str).collect();
    if let Capture::StdoutTo(path) = &invocation.capture {
        let body = if args.contains(&"-d") { PER_BASE } else { HISTOGRAM };
        return fs::write(path, body);
    }
    match invocation.program.as_str() {
        "bowtie2" => fs::write(after(&args, "-S"), SAM),
        "samtools" => match args[0] {
            "faidx" => fs::write(format!("{}.fai", args[1]), "chr1\t1000\t6\t60\t61\n"),
            "view" | "sort" => fs::copy(args[args.len() - 1], after(&args, "-o")).map(|_| ()),
            "index" => fs::write(format!("{}.bai", args[1]), "bai"),
            _ => Ok(()),
        },
        "java" => match args[2] {
            "MergeSamFiles" => fs::copy(keyed(&args, "I="), keyed(&args, "O=")).map(|_| ()),
            "MarkDuplicates" => {
                fs::copy(keyed(&args, "INPUT="), keyed(&args, "OUTPUT="))?;
                fs::write(keyed(&args, "METRICS_FILE="), "## METRICS CLASS\n")
            }
            _ => Ok(()),
        },
        _ => Ok(()),
    }
}

impl StageRunner for FakeRunner {
    async fn invoke(&self, invocation: &Invocation) -> Result<i32> {
        self.calls.lock().unwrap().push(invocation.clone());
        if (self.fail)(invocation) {
            return Ok(1);
        }
        produce_outputs(invocation)?;
        Ok(0)
    }
}

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    out_dir: PathBuf,
}

impl Fixture {
    fn new() -> Result<Self> {
        let dir = tempdir()?;
        let root = dir.path().to_path_buf();
        let out_dir = root.join("out");
        fs::create_dir_all(&out_dir)?;
        fs::write(root.join("ref.fa"), ">chr1\nACGTGGCC\n")?;
        Ok(Fixture { _dir: dir, root, out_dir })
    }

    fn config(&self, reads: ReadInputs) -> RunConfig {
        RunConfig {
            cwd: self.root.clone(),
            out_dir: self.out_dir.clone(),
            reference: self.root.join("ref.fa"),
            reads,
            tools: ToolPaths::default(),
            threads: 2,
            verbose: false,
            keep_temp: false,
            quality_cutoff: None,
            redundancy: false,
            mean_coverage: false,
            coverage_map: false,
            gc_content: false,
            force_rebuild: false,
        }
    }

    fn single(&self) -> ReadInputs {
        ReadInputs::Single(self.root.join("s.fq"))
    }

    fn all_reads(&self) -> ReadInputs {
        ReadInputs::PairedAndSingle {
            forward: self.root.join("f.fq"),
            reverse: self.root.join("r.fq"),
            single: self.root.join("s.fq"),
        }
    }

    fn out_names(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.out_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}

const TEMP_PREFIXES: &[&str] = &[
    "paired_", "single_", "merged_", "quality_", "markduplicates_", "redundant_", "view_", "sorted_",
    "map_", "perbase_", "mean_", "gc_",
];

fn has_temp_leftovers(names: &[String]) -> bool {
    names.iter().any(|n| {
        TEMP_PREFIXES.iter().any(|p| n.starts_with(p)) || (n.starts_with("redundancy_") && n.ends_with(".metrics"))
    })
}

fn is_merge(c: &Invocation) -> bool {
    c.args.iter().any(|a| a == "MergeSamFiles")
}

fn is_single_mapping(c: &Invocation) -> bool {
    c.program == "bowtie2" && c.args.iter().any(|a| a == "-U")
}

fn is_paired_mapping(c: &Invocation) -> bool {
    c.program == "bowtie2" && c.args.iter().any(|a| a == "-1")
}


#[tokio::test]
async fn test_single_end_run_publishes_clean_alignment() -> Result<()> {
    let fx = Fixture::new()?;
    let runner = FakeRunner::new();
    let summary = run_with_runner(&fx.config(fx.single()), &runner).await?;

    let names = fx.out_names();
    assert!(names.contains(&"clean_alignment.bam".to_string()));
    assert!(names.contains(&"remove_duplicates.metrics".to_string()));
    assert!(!has_temp_leftovers(&names), "leftovers: {:?}", names);
    assert!(!fx.root.join("ref.fa.fai").exists(), "faidx created by the run is temporary");
    assert_eq!(summary.cleanup_failures, 0);
    assert!(summary.redundancy.is_none());

    // Main reference-order pass drops secondary and supplementary alignments.
    let view = runner.calls().into_iter().find(|c| c.args.first().map(String::as_str) == Some("view")).unwrap();
    assert!(view.args.windows(2).any(|w| w[0] == "-F" && w[1] == "0x900"));
    assert!(view.args.iter().any(|a| a == "-t"));
    Ok(())
}

#[tokio::test]
async fn test_single_end_failure_falls_back_to_paired() -> Result<()> {
    let fx = Fixture::new()?;
    let runner = FakeRunner::failing(is_single_mapping);
    run_with_runner(&fx.config(fx.all_reads()), &runner).await?;

    let calls = runner.calls();
    assert!(!calls.iter().any(is_merge));
    let dedup = calls.iter().find(|c| c.args.iter().any(|a| a == "MarkDuplicates")).unwrap();
    let input = dedup.args.iter().find_map(|a| a.strip_prefix("INPUT=")).unwrap();
    assert!(Path::new(input).file_name().unwrap().to_string_lossy().starts_with("paired_"));
    assert!(fx.out_dir.join("clean_alignment.bam").exists());
    Ok(())
}

#[tokio::test]
async fn test_both_mappings_are_merged() -> Result<()> {
    let fx = Fixture::new()?;
    let runner = FakeRunner::new();
    run_with_runner(&fx.config(fx.all_reads()), &runner).await?;

    let calls = runner.calls();
    let merge = calls.iter().find(|c| is_merge(c)).expect("merge ran");
    assert!(merge.args.iter().any(|a| a == "SORT_ORDER=queryname"));
    assert_eq!(merge.args.iter().filter(|a| a.starts_with("I=")).count(), 2);
    assert!(!has_temp_leftovers(&fx.out_names()));
    Ok(())
}

#[tokio::test]
async fn test_merge_failure_keeps_paired_alignment() -> Result<()> {
    let fx = Fixture::new()?;
    let runner = FakeRunner::failing(is_merge);
    run_with_runner(&fx.config(fx.all_reads()), &runner).await?;

    let calls = runner.calls();
    let dedup = calls.iter().find(|c| c.args.iter().any(|a| a == "MarkDuplicates")).unwrap();
    let input = dedup.args.iter().find_map(|a| a.strip_prefix("INPUT=")).unwrap();
    assert!(Path::new(input).file_name().unwrap().to_string_lossy().starts_with("paired_"));
    // Neither the failed merge output nor the unused single-end alignment survive.
    assert!(!has_temp_leftovers(&fx.out_names()));
    Ok(())
}

#[tokio::test]
async fn test_all_mapping_failures_are_fatal() -> Result<()> {
    let fx = Fixture::new()?;
    let runner = FakeRunner::failing(|c| is_single_mapping(c) || is_paired_mapping(c));
    let result = run_with_runner(&fx.config(fx.all_reads()), &runner).await;

    assert!(matches!(result, Err(PipelineError::Fatal(_))));
    assert!(fx.out_names().is_empty(), "left behind: {:?}", fx.out_names());
    assert!(!fx.root.join("ref.fa.fai").exists());
    Ok(())
}

#[tokio::test]
async fn test_index_build_failure_is_fatal() -> Result<()> {
    let fx = Fixture::new()?;
    let runner = FakeRunner::failing(|c| c.program == "bowtie2-build");
    let result = run_with_runner(&fx.config(fx.single()), &runner).await;

    assert!(matches!(result, Err(PipelineError::Fatal(_))));
    assert_eq!(runner.calls().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_existing_index_is_reused() -> Result<()> {
    let fx = Fixture::new()?;
    fs::write(fx.root.join("ref.fa.1.bt2"), "")?;
    let runner = FakeRunner::new();
    run_with_runner(&fx.config(fx.single()), &runner).await?;
    assert!(!runner.calls().iter().any(|c| c.program == "bowtie2-build"));

    let mut config = fx.config(fx.single());
    config.force_rebuild = true;
    let runner = FakeRunner::new();
    run_with_runner(&config, &runner).await?;
    assert!(runner.calls().iter().any(|c| c.program == "bowtie2-build"));
    Ok(())
}

#[tokio::test]
async fn test_main_sort_failure_is_fatal_and_cleans_up() -> Result<()> {
    let fx = Fixture::new()?;
    let runner = FakeRunner::failing(|c| c.program == "samtools" && c.args[0] == "sort");
    let result = run_with_runner(&fx.config(fx.single()), &runner).await;

    assert!(matches!(result, Err(PipelineError::Fatal(_))));
    let names = fx.out_names();
    assert!(!has_temp_leftovers(&names), "leftovers: {:?}", names);
    // Artifacts published before the failure still get their names.
    assert!(names.contains(&"remove_duplicates.metrics".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_degraded_stages_do_not_stop_the_run() -> Result<()> {
    let fx = Fixture::new()?;
    let runner = FakeRunner::failing(|c| {
        c.args.first().map(String::as_str) == Some("faidx")
            || c.args.iter().any(|a| a == "MarkDuplicates")
            || c.args.first().map(String::as_str) == Some("view")
            || c.args.first().map(String::as_str) == Some("index")
    });
    run_with_runner(&fx.config(fx.single()), &runner).await?;

    let names = fx.out_names();
    assert!(names.contains(&"clean_alignment.bam".to_string()));
    assert!(!names.contains(&"remove_duplicates.metrics".to_string()));
    assert!(!has_temp_leftovers(&names), "leftovers: {:?}", names);

    let calls = runner.calls();
    let view = calls.iter().find(|c| c.args.first().map(String::as_str) == Some("view")).unwrap();
    assert!(!view.args.iter().any(|a| a == "-t"), "no faidx, no -t");
    // Sort falls back to the unconverted alignment.
    let sort = calls.iter().find(|c| c.args.first().map(String::as_str) == Some("sort")).unwrap();
    let sort_input = sort.args.last().unwrap();
    assert!(Path::new(sort_input).file_name().unwrap().to_string_lossy().starts_with("single_"));
    Ok(())
}

#[tokio::test]
async fn test_full_run_publishes_every_artifact() -> Result<()> {
    let fx = Fixture::new()?;
    let mut config = fx.config(fx.single());
    config.quality_cutoff = Some(1);
    config.redundancy = true;
    config.mean_coverage = true;
    config.coverage_map = true;
    config.gc_content = true;
    let runner = FakeRunner::new();
    let summary = run_with_runner(&config, &runner).await?;

    let names = fx.out_names();
    for published in [
        "clean_alignment.bam",
        "mean.coverage",
        "map.coverage",
        "redundancy.stats",
        "redundancy_alignments.bam",
        "redundancy_mean.coverage",
        "redundancy_map.coverage",
        "remove_duplicates.metrics",
        "gc_reference.tsv",
    ] {
        assert!(names.contains(&published.to_string()), "{} missing from {:?}", published, names);
    }
    assert!(!has_temp_leftovers(&names), "leftovers: {:?}", names);
    assert_eq!(summary.published.len(), 9);

    assert_eq!(fs::read_to_string(fx.out_dir.join("mean.coverage"))?, "chr1\t1.500\n");
    assert_eq!(fs::read_to_string(fx.out_dir.join("map.coverage"))?, PER_BASE);
    assert_eq!(fs::read_to_string(fx.out_dir.join("gc_reference.tsv"))?, "chr1\t0.75\n");

    let stats = fs::read_to_string(fx.out_dir.join("redundancy.stats"))?;
    assert!(stats.contains("Redundant alignments: 1 (50.00%)"));
    assert!(stats.contains("Redundant alignment rate: 1.50"));

    let Some(RedundancyReport::Found(report)) = summary.redundancy else {
        panic!("expected redundancy report");
    };
    assert_eq!(report.per_read.count, 1);
    assert_eq!(report.per_read.sum, 2);
    assert_eq!(report.mapped_reads, 2);

    // The redundant subset is ordered without dropping secondary alignments.
    let views: Vec<Invocation> = runner
        .calls()
        .into_iter()
        .filter(|c| c.args.first().map(String::as_str) == Some("view"))
        .collect();
    assert_eq!(views.len(), 2);
    assert_eq!(views.iter().filter(|c| c.args.iter().any(|a| a == "-F")).count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_redundant_subset_sort_failure_is_fatal_and_cleans_up() -> Result<()> {
    let fx = Fixture::new()?;
    let mut config = fx.config(fx.single());
    config.redundancy = true;
    // The first sort belongs to the redundant subset.
    let sorts = Mutex::new(0usize);
    let runner = FakeRunner::failing(move |c| {
        if c.program == "samtools" && c.args[0] == "sort" {
            let mut n = sorts.lock().unwrap();
            *n += 1;
            return *n == 1;
        }
        false
    });
    let result = run_with_runner(&config, &runner).await;

    assert!(matches!(result, Err(PipelineError::Fatal(_))));
    // The main alignment is never sorted after the abort.
    let sorts = runner.calls().iter().filter(|c| c.program == "samtools" && c.args[0] == "sort").count();
    assert_eq!(sorts, 1);

    let names = fx.out_names();
    assert!(!has_temp_leftovers(&names), "leftovers: {:?}", names);
    assert!(!names.contains(&"clean_alignment.bam".to_string()));
    assert!(!names.contains(&"redundancy_alignments.bam".to_string()));
    // Written before the sort, so still published.
    assert!(names.contains(&"redundancy.stats".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_redundancy_coverage_failures_are_degraded() -> Result<()> {
    let fx = Fixture::new()?;
    let mut config = fx.config(fx.single());
    config.redundancy = true;
    config.mean_coverage = true;
    let runner = FakeRunner::failing(|c| c.program == "genomeCoverageBed");
    let summary = run_with_runner(&config, &runner).await?;

    let names = fx.out_names();
    assert!(names.contains(&"clean_alignment.bam".to_string()));
    assert!(names.contains(&"redundancy.stats".to_string()));
    assert!(names.contains(&"redundancy_alignments.bam".to_string()));
    assert!(!names.contains(&"redundancy_mean.coverage".to_string()));
    assert!(!names.contains(&"mean.coverage".to_string()));
    assert!(!has_temp_leftovers(&names), "leftovers: {:?}", names);
    assert!(matches!(summary.redundancy, Some(RedundancyReport::Found(_))));
    Ok(())
}

#[tokio::test]
async fn test_keep_temp_archives_intermediate_files() -> Result<()> {
    let fx = Fixture::new()?;
    let mut config = fx.config(fx.single());
    config.keep_temp = true;
    let runner = FakeRunner::new();
    let summary = run_with_runner(&config, &runner).await?;

    let archive = summary.archive_dir.expect("archive directory");
    assert!(archive.starts_with(&fx.out_dir));
    assert!(!has_temp_leftovers(&fx.out_names()));

    let archived: Vec<String> = fs::read_dir(&archive)?
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert!(archived.iter().any(|n| n.starts_with("single_")));
    assert!(archived.iter().any(|n| n.starts_with("view_")));
    assert!(archived.iter().any(|n| n == "ref.fa.fai"));
    assert!(fx.out_dir.join("clean_alignment.bam").exists());
    Ok(())
}
