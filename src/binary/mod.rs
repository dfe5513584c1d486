use std::path::Path;

use object::Object;
use tracing::debug;

use crate::{arch::Arch, host::Host, syms::SymbolTable};

#[derive(thiserror::Error, Debug)]
pub enum BinaryError<HOSTERR>
where
    HOSTERR: std::fmt::Debug,
{
    #[error("host: {0:?}")]
    Host(HOSTERR),
    #[error("object")]
    Object(#[from] object::Error),
}

/// What the analysis needs from the traced executable: its function symbols
/// and the architecture it was built for.
#[derive(Debug)]
pub struct Binary {
    pub table: SymbolTable,
    /// `None` if the ELF machine isn't one we know the branch rules of
    pub arch: Option<Arch>,
}

impl Binary {
    /// Reads and parses the binary
    pub fn from_path<HOST>(host: &HOST, path: &Path) -> Result<Binary, BinaryError<HOST::Error>>
    where
        HOST: Host,
        <HOST as Host>::Error: std::fmt::Debug,
    {
        let raw = host.read_file(path).map_err(BinaryError::Host)?;
        Self::from_bytes(&raw)
    }

    pub fn from_bytes<E: std::fmt::Debug>(raw: &[u8]) -> Result<Binary, BinaryError<E>> {
        let file = object::File::parse(raw)?;

        let arch = Arch::from_object(file.architecture()).ok();
        let table = SymbolTable::from_object(&file);

        debug!("{} function symbols, arch {:?}", table.symbols.len(), arch);

        Ok(Binary { table, arch })
    }

    /// Static entry address of `function`, as the line oracle expects it
    pub fn entry(&self, function: &str, arch: Arch) -> Option<u64> {
        self.table
            .entry(function)
            .map(|value| arch.code_address(value))
    }
}
