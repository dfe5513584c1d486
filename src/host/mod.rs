pub mod native;

use std::{path::Path, process::Output};

/// - Reads the analyzed binary
/// - Runs the binutils used as oracles (addr2line and friends)
pub trait Host {
    type Error;
    fn run(&self, program: &str, args: &[String]) -> Result<Output, Self::Error>;
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, Self::Error>;
}
