// Namespaces: the dispatch buckets behind every function and method call.
//
// A bucket is keyed by (name, package); the empty name is the global
// function namespace, and a non-empty package names an overlay that shadows
// same-named functions in the base bucket while its package is active.
// Entries live in an arena so a resolved call site can patch a plain u32
// arena index into its code word; re-registering a name updates the arena
// entry in place, which keeps already-patched sites current.

use std::collections::HashMap;
use std::rc::Rc;

use crate::codeblock::CodeBlock;
use crate::ident::Ident;
use crate::interp::Interp;
use crate::sim::ObjectId;


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NsId(pub usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EntryId(pub u32);


// Host callbacks come in five return shapes. The interpreter coerces the
// result into whichever workspace the following opcode wants.
#[derive(Copy, Clone)]
pub enum HostFn {
    Str(fn(&mut Interp, Option<ObjectId>, &[String]) -> String),
    Int(fn(&mut Interp, Option<ObjectId>, &[String]) -> i32),
    Float(fn(&mut Interp, Option<ObjectId>, &[String]) -> f64),
    Void(fn(&mut Interp, Option<ObjectId>, &[String])),
    Bool(fn(&mut Interp, Option<ObjectId>, &[String]) -> bool),
}

#[derive(Clone)]
pub enum EntryKind {
    // offset 0 is a forward declaration with no body
    Script { code: Rc<CodeBlock>, offset: u32 },
    Host { func: HostFn, min_args: u32, max_args: u32, usage: &'static str },
}

#[derive(Clone)]
pub struct Entry {
    pub name: Ident,
    pub namespace: NsId,
    pub package: Ident,
    pub kind: EntryKind,
}


struct Namespace {
    name: Ident,
    package: Ident,
    parent: Option<NsId>,
    table: HashMap<Ident, EntryId>,
}


pub struct Namespaces {
    spaces: Vec<Namespace>,
    index: HashMap<(Ident, Ident), NsId>,
    entries: Vec<Entry>,
    active_packages: Vec<Ident>,
    linked: bool,
}

impl Namespaces {
    pub fn new() -> Namespaces {
        let mut namespaces = Namespaces {
            spaces: Vec::new(),
            index: HashMap::new(),
            entries: Vec::new(),
            active_packages: Vec::new(),
            linked: true,
        };
        namespaces.find(Ident::EMPTY);
        namespaces
    }

    // The global function namespace.
    pub fn global(&self) -> NsId {
        NsId(0)
    }

    pub fn find(&mut self, name: Ident) -> NsId {
        self.find_in_package(name, Ident::EMPTY)
    }

    pub fn find_in_package(&mut self, name: Ident, package: Ident) -> NsId {
        if let Some(&id) = self.index.get(&(name, package)) {
            return id;
        }
        let id = NsId(self.spaces.len());
        self.spaces.push(Namespace { name, package, parent: None, table: HashMap::new() });
        self.index.insert((name, package), id);
        id
    }

    pub fn name(&self, ns: NsId) -> Ident {
        self.spaces[ns.0].name
    }

    pub fn parent(&self, ns: NsId) -> Option<NsId> {
        self.spaces[ns.0].parent
    }

    pub fn set_parent(&mut self, ns: NsId, parent: Option<NsId>) {
        self.spaces[ns.0].parent = parent;
    }

    pub fn add_script_function(
        &mut self,
        ns: NsId,
        name: Ident,
        code: Rc<CodeBlock>,
        offset: u32,
    ) -> EntryId {
        let package = self.spaces[ns.0].package;
        self.insert(ns, name, package, EntryKind::Script { code, offset })
    }

    pub fn add_host_function(
        &mut self,
        ns: NsId,
        name: Ident,
        func: HostFn,
        min_args: u32,
        max_args: u32,
        usage: &'static str,
    ) -> EntryId {
        let package = self.spaces[ns.0].package;
        self.insert(ns, name, package, EntryKind::Host { func, min_args, max_args, usage })
    }

    fn insert(&mut self, ns: NsId, name: Ident, package: Ident, kind: EntryKind) -> EntryId {
        let entry = Entry { name, namespace: ns, package, kind };
        if let Some(&id) = self.spaces[ns.0].table.get(&name) {
            self.entries[id.0 as usize] = entry;
            return id;
        }
        let id = EntryId(self.entries.len() as u32);
        self.entries.push(entry);
        self.spaces[ns.0].table.insert(name, id);
        id
    }

    // Walk package overlays (newest activation first, while linked), then
    // the base bucket, then the parent chain.
    pub fn lookup(&self, ns: NsId, name: Ident) -> Option<EntryId> {
        let mut current = Some(ns);
        while let Some(at) = current {
            let space = &self.spaces[at.0];
            if self.linked {
                for &package in self.active_packages.iter().rev() {
                    if let Some(&bucket) = self.index.get(&(space.name, package)) {
                        if let Some(&id) = self.spaces[bucket.0].table.get(&name) {
                            return Some(id);
                        }
                    }
                }
            }
            if let Some(&id) = space.table.get(&name) {
                return Some(id);
            }
            current = space.parent;
        }
        None
    }

    pub fn entry(&self, id: EntryId) -> Option<&Entry> {
        self.entries.get(id.0 as usize)
    }

    pub fn activate_package(&mut self, package: Ident) {
        if !package.is_empty() && !self.active_packages.contains(&package) {
            self.active_packages.push(package);
        }
    }

    pub fn deactivate_package(&mut self, package: Ident) {
        self.active_packages.retain(|&p| p != package);
    }

    // Function declaration brackets its registration with these so the new
    // entry binds into the package's own bucket instead of an overlay view.
    pub fn unlink_packages(&mut self) {
        self.linked = false;
    }

    pub fn relink_packages(&mut self) {
        self.linked = true;
    }

    // Diagnostic helper: the chain of namespace names from `ns` up.
    pub fn chain_names(&self, ns: NsId, resolve: impl Fn(Ident) -> String) -> String {
        let mut names = Vec::new();
        let mut current = Some(ns);
        while let Some(at) = current {
            let space = &self.spaces[at.0];
            names.push(resolve(space.name));
            current = space.parent;
        }
        names.join(" -> ")
    }
}
