pub mod command;
pub mod coverage;
pub mod fastx;
pub mod file;
pub mod ledger;
pub mod process;
pub mod redundancy;
pub mod sambam;
pub mod stats;
pub mod streams;
pub mod system;
