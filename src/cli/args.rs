use clap::Parser;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "mapcov", version, about = "Maps reads onto a reference and reports clean alignments, redundancy and coverage")]
pub struct Arguments {

    #[arg(short = '1', long = "fwd", requires = "reverse", help = "Forward read file")]
    pub forward: Option<String>,

    #[arg(short = '2', long = "rev", requires = "forward", help = "Reverse read file")]
    pub reverse: Option<String>,

    #[arg(short = 's', long = "single", help = "Single read file")]
    pub single: Option<String>,

    #[arg(short = 'r', long = "ref", help = "Reference sequence file (FASTA)")]
    pub reference: String,

    #[arg(short = 'o', long = "output", help = "Output directory; created when missing")]
    pub out_dir: String,

    #[arg(short = 'v', long = "verbose", action, help = "Echo the output of every external command to the console")]
    pub verbose: bool,

    #[arg(short = 'c', long = "cov-map", action, help = "Report the coverage of each reference position")]
    pub cov_map: bool,

    #[arg(short = 'm', long = "mean-cov", action, help = "Report the mean coverage of each reference sequence")]
    pub mean_cov: bool,

    #[arg(short = 'k', long = "keep-tmp", action, help = "Move temporary files into a tmp directory inside the output folder instead of deleting them")]
    pub keep_tmp: bool,

    #[arg(short = 'f', long = "filter-qual", default_value_t = -1, allow_negative_numbers = true, help = "Drop alignments with a mapping quality below this value (negative disables)")]
    pub filter_qual: i32,

    #[arg(short = 'd', long = "redundancy", action, help = "Save and analyse redundant alignments (see -c and -m)")]
    pub redundancy: bool,

    #[arg(short = 'g', long = "gc-count", action, help = "Report the GC content of each reference sequence")]
    pub gc_count: bool,

    #[arg(short = 't', long = "threads", help = "Threads handed to the aligner; defaults to the physical core count")]
    pub threads: Option<usize>,

    #[arg(long, default_value_t = false, help = "Rebuild the bowtie2 index even when one exists")]
    pub force_rebuild: bool,

    #[arg(long, default_value_t = false)]
    pub skip_version_check: bool,

    #[arg(long, default_value = "bowtie2")]
    pub bowtie2: String,

    #[arg(long, default_value = "bowtie2-build")]
    pub bowtie2_build: String,

    #[arg(long, default_value = "samtools")]
    pub samtools: String,

    #[arg(long, default_value = "java")]
    pub java: String,

    #[arg(long, env = "PICARD_JAR", default_value = "picard.jar", help = "Path to picard.jar")]
    pub picard: String,

    #[arg(long, default_value = "genomeCoverageBed")]
    pub genome_coverage_bed: String,
}
