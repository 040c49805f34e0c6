// Interned identifier table.
//
// Identifiers travel through compiled code as 32-bit handles; comparing two
// interned names is handle equality and resolving a handle back to its text
// is an array index. Interning is case-insensitive (script identifiers are),
// but the first spelling seen is the one resolved back out.

use std::collections::HashMap;


// Zero is the empty identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Ident(pub u32);

impl Ident {
    pub const EMPTY: Ident = Ident(0);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn word(self) -> u32 {
        self.0
    }
}


pub struct IdentTable {
    names: Vec<String>,
    index: HashMap<String, u32>,
}

impl IdentTable {
    pub fn new() -> IdentTable {
        IdentTable {
            names: vec![String::new()],
            index: HashMap::new(),
        }
    }

    pub fn intern(&mut self, name: &str) -> Ident {
        if name.is_empty() {
            return Ident::EMPTY;
        }
        let key = name.to_ascii_lowercase();
        if let Some(&id) = self.index.get(&key) {
            return Ident(id);
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.index.insert(key, id);
        Ident(id)
    }

    // Intern the first `len` bytes of `name`.
    pub fn intern_prefix(&mut self, name: &str, len: usize) -> Ident {
        self.intern(&name[..len.min(name.len())])
    }

    pub fn resolve(&self, id: Ident) -> &str {
        self.names
            .get(id.0 as usize)
            .map(|s| s.as_str())
            .unwrap_or("")
    }
}
