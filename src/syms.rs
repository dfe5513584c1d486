use object::{Object, ObjectSymbol, SymbolKind};
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub struct SymbolReference {
    pub symbol: Symbol,
    pub offset: u64, // how much after the start of the symbol
}

impl Display for SymbolReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{:x}", self.symbol.name, self.offset)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub from: u64,
    to: u64,
}

impl Symbol {
    pub fn new(name: impl Into<String>, from: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            from,
            to: from.saturating_add(size),
        }
    }
}

/// Function symbols at their link-time (static) addresses, what `nm` lists
/// with type `T`.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    pub symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn from_object(file: &object::File) -> Self {
        let mut symbols: Vec<_> = file
            .symbols()
            // stripped binaries still export something
            .chain(file.dynamic_symbols())
            .filter(|sym| sym.kind() == SymbolKind::Text && sym.is_definition())
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                if name.is_empty() {
                    return None;
                }
                Some(Symbol::new(name, sym.address(), sym.size()))
            })
            .collect();

        symbols.sort_by(|a, b| a.from.cmp(&b.from).then_with(|| a.name.cmp(&b.name)));
        symbols.dedup();

        Self { symbols }
    }

    /// Static address of the function called `name`
    pub fn entry(&self, name: &str) -> Option<u64> {
        self.symbols.iter().find(|s| s.name == name).map(|s| s.from)
    }

    pub fn lookup(&self, adr: u64) -> Option<SymbolReference> {
        self.symbols
            .iter()
            .find(|s| s.from <= adr && adr < s.to)
            .cloned()
            .map(|s| SymbolReference {
                offset: adr - s.from,
                symbol: s,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::{Symbol, SymbolTable};

    fn table() -> SymbolTable {
        SymbolTable {
            symbols: vec![
                Symbol::new("helper", 0x1149, 0x40),
                Symbol::new("compute", 0x1189, 0x30),
                Symbol::new("main", 0x11b9, 0x50),
            ],
        }
    }

    #[test]
    fn entry_by_name() {
        assert_eq!(table().entry("compute"), Some(0x1189));
        assert_eq!(table().entry("comp"), None);
    }

    #[test]
    fn lookup_inside_symbol() {
        let table = table();
        let r = table.lookup(0x1190).unwrap();
        assert_eq!(r.symbol.name, "compute");
        assert_eq!(r.offset, 7);
        assert_eq!(r.to_string(), "compute+7");

        assert!(table.lookup(0x11b9 + 0x50).is_none());
        assert!(table.lookup(0x1000).is_none());
    }
}
