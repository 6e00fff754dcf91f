//! Functions and structs for creating the command-line arguments of each external tool

use std::path::Path;
use anyhow::{anyhow, Result};
use log::{info, warn};
use crate::config::defs::{RunConfig, TOOL_VERSIONS, BOWTIE2_TAG, SAMTOOLS_TAG, BEDTOOLS_TAG};


fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}


pub mod bowtie2 {
    use std::path::{Path, PathBuf};
    use crate::config::defs::{RunConfig, BOWTIE2_INDEX_SUFFIX};
    use super::path_arg;

    /// Report every valid alignment, which the redundancy analysis depends on.
    pub const REPORT_ALL: &str = "-a";

    pub fn index_exists(reference: &Path) -> bool {
        let mut first_index = reference.as_os_str().to_os_string();
        first_index.push(BOWTIE2_INDEX_SUFFIX);
        PathBuf::from(first_index).exists()
    }

    /// `bowtie2-build <ref> <ref>`: the index basename is the reference path.
    pub fn build_arg_generator(reference: &Path) -> Vec<String> {
        vec![path_arg(reference), path_arg(reference)]
    }

    fn common_args(config: &RunConfig) -> Vec<String> {
        vec![
            REPORT_ALL.to_string(),
            "-p".to_string(),
            config.threads.to_string(),
        ]
    }

    pub fn single_end_arg_generator(config: &RunConfig, single: &Path, output: &Path) -> Vec<String> {
        let mut args_vec = common_args(config);
        args_vec.push("-U".to_string());
        args_vec.push(path_arg(single));
        args_vec.push("-x".to_string());
        args_vec.push(path_arg(&config.reference));
        args_vec.push("-S".to_string());
        args_vec.push(path_arg(output));
        args_vec
    }

    pub fn paired_end_arg_generator(config: &RunConfig, forward: &Path, reverse: &Path, output: &Path) -> Vec<String> {
        let mut args_vec = common_args(config);
        args_vec.push("-1".to_string());
        args_vec.push(path_arg(forward));
        args_vec.push("-2".to_string());
        args_vec.push(path_arg(reverse));
        args_vec.push("-x".to_string());
        args_vec.push(path_arg(&config.reference));
        args_vec.push("-S".to_string());
        args_vec.push(path_arg(output));
        args_vec
    }
}


pub mod samtools {
    use std::path::Path;
    use crate::config::defs::SamtoolsSubcommand;
    use super::path_arg;

    pub fn faidx_arg_generator(reference: &Path) -> Vec<String> {
        vec![SamtoolsSubcommand::Faidx.as_str().to_string(), path_arg(reference)]
    }

    /// BAM conversion, optionally excluding alignments matching `exclude_flags`.
    /// Without a faidx the reference layout is taken from the SAM header.
    pub fn view_arg_generator(
        faidx: Option<&Path>,
        input: &Path,
        output: &Path,
        exclude_flags: Option<&str>,
    ) -> Vec<String> {
        let mut args_vec = vec![SamtoolsSubcommand::View.as_str().to_string()];
        if let Some(flags) = exclude_flags {
            args_vec.push("-F".to_string());
            args_vec.push(flags.to_string());
        }
        args_vec.push("-b".to_string());
        if let Some(fai) = faidx {
            args_vec.push("-t".to_string());
            args_vec.push(path_arg(fai));
        }
        args_vec.push("-o".to_string());
        args_vec.push(path_arg(output));
        args_vec.push(path_arg(input));
        args_vec
    }

    pub fn sort_arg_generator(input: &Path, output: &Path) -> Vec<String> {
        vec![
            SamtoolsSubcommand::Sort.as_str().to_string(),
            "-o".to_string(),
            path_arg(output),
            path_arg(input),
        ]
    }

    pub fn index_arg_generator(input: &Path) -> Vec<String> {
        vec![SamtoolsSubcommand::Index.as_str().to_string(), path_arg(input)]
    }
}


pub mod picard {
    use std::path::Path;
    use crate::config::defs::{PicardSubcommand, QUERYNAME_SORT_ORDER};

    fn jar_args(jar: &str, subcommand: PicardSubcommand) -> Vec<String> {
        vec!["-jar".to_string(), jar.to_string(), subcommand.as_str().to_string()]
    }

    pub fn merge_arg_generator(jar: &str, inputs: &[&Path], output: &Path) -> Vec<String> {
        let mut args_vec = jar_args(jar, PicardSubcommand::MergeSamFiles);
        for input in inputs {
            args_vec.push(format!("I={}", input.display()));
        }
        args_vec.push(format!("O={}", output.display()));
        args_vec.push(format!("SORT_ORDER={}", QUERYNAME_SORT_ORDER));
        args_vec.push("USE_THREADING=true".to_string());
        args_vec
    }

    pub fn mark_duplicates_arg_generator(
        jar: &str,
        input: &Path,
        output: &Path,
        metrics: &Path,
        sort_order: &str,
    ) -> Vec<String> {
        let mut args_vec = jar_args(jar, PicardSubcommand::MarkDuplicates);
        args_vec.push(format!("INPUT={}", input.display()));
        args_vec.push(format!("OUTPUT={}", output.display()));
        args_vec.push(format!("METRICS_FILE={}", metrics.display()));
        args_vec.push(format!("ASSUME_SORT_ORDER={}", sort_order));
        args_vec.push("VALIDATION_STRINGENCY=LENIENT".to_string());
        args_vec.push("MAX_FILE_HANDLES_FOR_READ_ENDS_MAP=1000".to_string());
        args_vec.push("REMOVE_DUPLICATES=TRUE".to_string());
        args_vec
    }
}


pub mod bedtools {
    use std::path::Path;
    use super::path_arg;

    /// Histogram output by default, one row per position with `per_base`.
    /// Results go to stdout.
    pub fn genome_coverage_arg_generator(bam: &Path, per_base: bool) -> Vec<String> {
        let mut args_vec = Vec::new();
        if per_base {
            args_vec.push("-d".to_string());
        }
        args_vec.push("-ibam".to_string());
        args_vec.push(path_arg(bam));
        args_vec
    }
}


/// Pulls `major.minor` out of the first token that looks like a version.
pub fn parse_version(line: &str) -> Option<(u32, u32)> {
    line.split_whitespace().find_map(|token| {
        let token = token.trim_start_matches('v');
        let mut parts = token.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.chars().take_while(|c| c.is_ascii_digit()).collect::<String>().parse().ok()?;
        Some((major, minor))
    })
}


async fn tool_version(program: &str, flag: &str) -> Result<(u32, u32)> {
    use tokio::process::Command;
    use crate::utils::streams::{read_child_output_to_vec, ChildStream};

    let mut child = Command::new(program)
        .arg(flag)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| anyhow!("Failed to spawn {}: {}. Is it installed?", program, e))?;

    let lines = read_child_output_to_vec(&mut child, ChildStream::Stdout).await?;
    child.wait().await?;
    let first_line = lines
        .first()
        .ok_or_else(|| anyhow!("No output from {} {}", program, flag))?;
    parse_version(first_line).ok_or_else(|| anyhow!("Invalid {} {} output: {}", program, flag, first_line))
}


/// Probes the external tools before a run. Problems are only warned about:
/// a missing tool surfaces again, with its own policy, at the stage using it.
pub async fn check_versions(config: &RunConfig) {
    let mut probes = vec![
        (BOWTIE2_TAG, config.tools.bowtie2.as_str(), "--version"),
        (SAMTOOLS_TAG, config.tools.samtools.as_str(), "--version"),
    ];
    if config.mean_coverage || config.coverage_map {
        probes.push((BEDTOOLS_TAG, config.tools.genome_coverage_bed.as_str(), "-version"));
    }

    for (tag, program, flag) in probes {
        match tool_version(program, flag).await {
            Ok(found) => {
                let minimum = TOOL_VERSIONS.get(tag).copied().unwrap_or((0, 0));
                if found < minimum {
                    warn!("{} {}.{} is older than the tested {}.{}", tag, found.0, found.1, minimum.0, minimum.1);
                } else {
                    info!("Found {} {}.{}", tag, found.0, found.1);
                }
            }
            Err(e) => warn!("Cannot determine {} version: {}", tag, e),
        }
    }
}
