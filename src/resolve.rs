//! Mapping traced (runtime) addresses back to `file:line`.

use crate::host::Host;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt::{self, Debug, Display, Formatter},
    path::PathBuf,
};
use tracing::{trace, warn};

/// A `file:line` as the line oracle printed it, possibly still carrying a
/// `(discriminator N)` suffix.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SourceLine(String);

impl SourceLine {
    pub fn new(line: impl Into<String>) -> Self {
        Self(line.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before the line number
    pub fn file(&self) -> &str {
        self.0.rsplit_once(':').map_or(&self.0, |(file, _)| file)
    }

    /// Same line without the discriminator
    pub fn normalized(&self) -> SourceLine {
        lazy_static! {
            static ref DISCRIMINATOR: Regex = Regex::new(r"\s*\(discriminator \d+\)\s*$").unwrap();
        }

        SourceLine(DISCRIMINATOR.replace(&self.0, "").into_owned())
    }
}

impl Display for SourceLine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Merges counts of lines which only differ by their discriminator.
pub fn normalize_discriminators(counts: HashMap<SourceLine, u64>) -> HashMap<SourceLine, u64> {
    let mut normalized = HashMap::with_capacity(counts.len());

    for (line, count) in counts {
        *normalized.entry(line.normalized()).or_insert(0) += count;
    }

    normalized
}

/// Static address to `file:line`. Answers containing `??` mean there is no
/// mapping.
pub trait LineOracle {
    fn lookup(&self, address: u64) -> Option<String>;
}

impl LineOracle for HashMap<u64, String> {
    fn lookup(&self, address: u64) -> Option<String> {
        self.get(&address).cloned()
    }
}

/// Asks binutils' `addr2line`, one process per address.
pub struct Addr2Line<'h, H> {
    host: &'h H,
    tool: String,
    binary: PathBuf,
}

impl<'h, H> Addr2Line<'h, H> {
    pub fn new(host: &'h H, tool: impl Into<String>, binary: impl Into<PathBuf>) -> Self {
        Self {
            host,
            tool: tool.into(),
            binary: binary.into(),
        }
    }
}

impl<'h, H> LineOracle for Addr2Line<'h, H>
where
    H: Host,
    H::Error: Debug,
{
    fn lookup(&self, address: u64) -> Option<String> {
        let args = vec![
            String::from("-e"),
            self.binary.to_string_lossy().into_owned(),
            format!("{:#x}", address),
        ];

        let output = match self.host.run(&self.tool, &args) {
            Ok(output) => output,
            Err(e) => {
                warn!("could not run {}: {:?}", self.tool, e);
                return None;
            }
        };

        if !output.status.success() {
            warn!(
                "{} failed for {:#x}: {}",
                self.tool,
                address,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().next()?.trim();

        if line.is_empty() {
            None
        } else {
            Some(line.to_string())
        }
    }
}

/// Rebases runtime addresses onto the binary and remembers every answer for
/// the rest of the run.
pub struct AddressResolver<O> {
    oracle: O,
    runtime_entry: u64,
    static_entry: u64,
    cache: HashMap<u64, Option<SourceLine>>,
}

impl<O: LineOracle> AddressResolver<O> {
    pub fn new(oracle: O, runtime_entry: u64, static_entry: u64) -> Self {
        Self {
            oracle,
            runtime_entry,
            static_entry,
            cache: HashMap::new(),
        }
    }

    pub fn runtime_entry(&self) -> u64 {
        self.runtime_entry
    }

    /// runtime address - (runtime entry - static entry)
    pub fn rebase(&self, address: u64) -> u64 {
        address.wrapping_sub(self.runtime_entry.wrapping_sub(self.static_entry))
    }

    pub fn resolve(&mut self, address: u64) -> Option<SourceLine> {
        if let Some(cached) = self.cache.get(&address) {
            return cached.clone();
        }

        let static_address = self.rebase(address);
        let resolved = self
            .oracle
            .lookup(static_address)
            .filter(|line| !line.contains("??"))
            .map(SourceLine::new);

        trace!("{:#x} -> {:#x} -> {:?}", address, static_address, resolved);

        self.cache.insert(address, resolved.clone());
        resolved
    }

    /// Number of distinct addresses looked up so far
    pub fn lookups(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_discriminators, AddressResolver, LineOracle, SourceLine};
    use std::{cell::Cell, collections::HashMap};

    struct Counting<'a> {
        calls: &'a Cell<usize>,
    }

    impl LineOracle for Counting<'_> {
        fn lookup(&self, address: u64) -> Option<String> {
            self.calls.set(self.calls.get() + 1);
            match address {
                0x1000 => Some("a.c:5".into()),
                0x1004 => Some("??:0".into()),
                _ => Some("??:?".into()),
            }
        }
    }

    #[test]
    fn rebases_and_caches() {
        let calls = Cell::new(0);
        let mut resolver = AddressResolver::new(Counting { calls: &calls }, 0x10, 0x1000);

        assert_eq!(resolver.rebase(0x14), 0x1004);
        assert_eq!(resolver.resolve(0x10), Some(SourceLine::new("a.c:5")));
        assert_eq!(resolver.resolve(0x10), Some(SourceLine::new("a.c:5")));
        assert_eq!(resolver.resolve(0x14), None);
        assert_eq!(resolver.resolve(0x14), None);
        assert_eq!(calls.get(), 2);
        assert_eq!(resolver.lookups(), 2);
    }

    #[test]
    fn rebases_downwards() {
        let oracle: HashMap<u64, String> = HashMap::from([(0x1139, "m.c:3".to_string())]);
        let mut resolver = AddressResolver::new(oracle, 0x555555555139, 0x1139);
        assert_eq!(resolver.rebase(0x555555555140), 0x1140);
        assert_eq!(resolver.resolve(0x555555555139), Some(SourceLine::new("m.c:3")));
    }

    #[test]
    fn source_line_parts() {
        let line = SourceLine::new("/home/u/src/a.c:9 (discriminator 1)");
        assert_eq!(line.normalized(), SourceLine::new("/home/u/src/a.c:9"));
        assert_eq!(line.normalized().file(), "/home/u/src/a.c");
        assert_eq!(SourceLine::new("a.c:9").normalized(), SourceLine::new("a.c:9"));
    }

    #[test]
    fn discriminators_are_merged() {
        let counts = HashMap::from([
            (SourceLine::new("a.c:9 (discriminator 1)"), 3),
            (SourceLine::new("a.c:9"), 2),
            (SourceLine::new("a.c:10 (discriminator 4)"), 1),
        ]);

        let normalized = normalize_discriminators(counts);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[&SourceLine::new("a.c:9")], 5);
        assert_eq!(normalized[&SourceLine::new("a.c:10")], 1);
    }

    #[cfg(unix)]
    #[test]
    fn addr2line_output() {
        use super::Addr2Line;
        use crate::host::Host;
        use std::{
            os::unix::process::ExitStatusExt,
            path::Path,
            process::{ExitStatus, Output},
        };

        struct Canned;

        impl Host for Canned {
            type Error = String;

            fn run(&self, program: &str, args: &[String]) -> Result<Output, String> {
                assert_eq!(program, "addr2line");
                assert_eq!(args[..2], ["-e".to_string(), "bin".to_string()]);
                let (code, stdout) = match args[2].as_str() {
                    "0x1139" => (0, "/src/a.c:9 (discriminator 2)\n"),
                    "0x2000" => (0, "??:0\n"),
                    "0x3000" => (0, ""),
                    _ => (1 << 8, ""),
                };
                Ok(Output {
                    status: ExitStatus::from_raw(code),
                    stdout: stdout.as_bytes().to_vec(),
                    stderr: Vec::new(),
                })
            }

            fn read_file(&self, _: &Path) -> Result<Vec<u8>, String> {
                Err("unused".into())
            }
        }

        let oracle = Addr2Line::new(&Canned, "addr2line", "bin");
        assert_eq!(
            oracle.lookup(0x1139).as_deref(),
            Some("/src/a.c:9 (discriminator 2)")
        );
        assert_eq!(oracle.lookup(0x3000), None);
        assert_eq!(oracle.lookup(0x4000), None);

        let mut resolver = AddressResolver::new(oracle, 0x2000, 0x2000);
        assert_eq!(resolver.resolve(0x2000), None);
    }

    #[test]
    fn normalizing_twice_changes_nothing() {
        let counts = HashMap::from([
            (SourceLine::new("a.c:9 (discriminator 1)"), 3),
            (SourceLine::new("a.c:9 (discriminator 2)"), 4),
            (SourceLine::new("b.c:1"), 7),
        ]);

        let once = normalize_discriminators(counts);
        let twice = normalize_discriminators(once.clone());
        assert_eq!(once, twice);
    }
}
