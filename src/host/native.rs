use std::{
    fs,
    path::Path,
    process::{Command, Output, Stdio},
};
use tracing::trace;

use super::Host;

/// Runs everything directly on this machine
pub struct Native {}

impl Host for Native {
    type Error = anyhow::Error;

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, anyhow::Error> {
        Ok(fs::read(path)?)
    }

    fn run(&self, program: &str, args: &[String]) -> Result<Output, Self::Error> {
        trace!("{} {:?}", program, args);

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::Native;
    use crate::host::Host;
    use std::path::Path;

    #[test]
    fn missing_program_is_an_error() {
        let host = Native {};
        assert!(host.run("tracecount-no-such-tool", &[]).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let host = Native {};
        assert!(host
            .read_file(Path::new("/nonexistent/tracecount/binary"))
            .is_err());
    }
}
