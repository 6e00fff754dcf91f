pub mod coverage_analysis;
