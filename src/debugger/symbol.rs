//! Symbol table view: the ELF `.symtab`/`.dynsym` projection the REPL's `symbol` command reads.
//! Exact-name lookup only (no regex, no demangling — both out of this spec's scope).

use object::{Object, ObjectSymbol, ObjectSymbolTable, SymbolKind as ObjSymbolKind};

use crate::debugger::address::GlobalAddress;

/// The five symbol kinds this spec distinguishes. Every other `object::SymbolKind` (common,
/// tls, label, ...) collapses to `Notype`, matching §4.3's "any other type maps to notype".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Notype,
    Object,
    Func,
    Section,
    File,
}

impl SymbolKind {
    fn from_object(kind: ObjSymbolKind) -> Self {
        match kind {
            ObjSymbolKind::Data => SymbolKind::Object,
            ObjSymbolKind::Text => SymbolKind::Func,
            ObjSymbolKind::Section => SymbolKind::Section,
            ObjSymbolKind::File => SymbolKind::File,
            _ => SymbolKind::Notype,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SymbolKind::Notype => "notype",
            SymbolKind::Object => "object",
            SymbolKind::Func => "func",
            SymbolKind::Section => "section",
            SymbolKind::File => "file",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub name_index: usize,
    pub addr: GlobalAddress,
}

/// Every named symbol from both the primary and dynamic symbol tables, kept in scan order.
/// Duplicates (a symbol present in both tables) are kept, matching §4.3's "duplicates are kept".
pub struct SymbolTable {
    names: Vec<String>,
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn load<'data, O: Object<'data>>(object_file: &O) -> Self {
        let mut names = vec![];
        let mut symbols = vec![];

        let mut scan = |name: &str, kind: ObjSymbolKind, addr: u64| {
            let name_index = names.len();
            names.push(name.to_string());
            symbols.push(Symbol {
                kind: SymbolKind::from_object(kind),
                name_index,
                addr: GlobalAddress::from(addr),
            });
        };

        if let Some(symtab) = object_file.symbol_table() {
            for symbol in symtab.symbols() {
                if let Ok(name) = symbol.name() {
                    scan(name, symbol.kind(), symbol.address());
                }
            }
        }

        if let Some(dynsym) = object_file.dynamic_symbol_table() {
            for symbol in dynsym.symbols() {
                if let Ok(name) = symbol.name() {
                    scan(name, symbol.kind(), symbol.address());
                }
            }
        }

        SymbolTable { names, symbols }
    }

    /// Every symbol (in scan order, `.symtab` then `.dynsym`) whose name matches exactly.
    pub fn lookup(&self, name: &str) -> Vec<(&str, &Symbol)> {
        self.symbols
            .iter()
            .filter(|s| self.names[s.name_index] == name)
            .map(|s| (self.names[s.name_index].as_str(), s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(entries: &[(&str, ObjSymbolKind, u64)]) -> SymbolTable {
        let mut names = vec![];
        let mut symbols = vec![];
        for (name, kind, addr) in entries {
            names.push(name.to_string());
            symbols.push(Symbol {
                kind: SymbolKind::from_object(*kind),
                name_index: names.len() - 1,
                addr: GlobalAddress::from(*addr),
            });
        }
        SymbolTable { names, symbols }
    }

    #[test]
    fn lookup_is_exact_not_substring() {
        let table = table_with(&[("main", ObjSymbolKind::Text, 0x1000)]);
        assert_eq!(table.lookup("main").len(), 1);
        assert!(table.lookup("mai").is_empty());
        assert!(table.lookup("main2").is_empty());
    }

    #[test]
    fn lookup_keeps_duplicates_across_tables() {
        let table = table_with(&[
            ("process", ObjSymbolKind::Text, 0x1000),
            ("process", ObjSymbolKind::Text, 0x1000),
        ]);
        assert_eq!(table.lookup("process").len(), 2);
    }

    #[test]
    fn unmapped_kinds_collapse_to_notype() {
        assert_eq!(SymbolKind::from_object(ObjSymbolKind::Tls), SymbolKind::Notype);
        assert_eq!(SymbolKind::from_object(ObjSymbolKind::Unknown), SymbolKind::Notype);
        assert_eq!(SymbolKind::from_object(ObjSymbolKind::Text), SymbolKind::Func);
    }
}
