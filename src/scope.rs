// Variables and scopes.
//
// A slot keeps all three value views (int, float, string) and a tag saying
// which one was written last; the views are kept in sync on every save, so
// loads never convert except for host-typed slots, which delegate both
// directions to a codec owned by the host. Scope frames stack up under the
// interpreter; a frame is either its own dictionary or a reference to a
// deeper frame, in which case local writes go through to that frame.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::codeblock::CodeBlock;
use crate::ident::Ident;
use crate::namespace::NsId;
use crate::util::{fmt_float, fmt_int, parse_float, parse_int};


// Externally-typed storage behind a slot. The slot never re-tags to an
// internal kind; every read and write goes through here.
pub trait HostValue {
    fn get(&self) -> String;
    fn set(&mut self, value: &str);
}

#[derive(Clone)]
pub enum SlotKind {
    Int,
    Float,
    Str,
    Host(Rc<RefCell<dyn HostValue>>),
}

pub struct Slot {
    pub kind: SlotKind,
    ival: u32,
    fval: f64,
    sval: String,
}

impl Slot {
    pub fn new() -> Slot {
        Slot { kind: SlotKind::Str, ival: 0, fval: 0.0, sval: String::new() }
    }

    pub fn host(value: Rc<RefCell<dyn HostValue>>) -> Slot {
        Slot { kind: SlotKind::Host(value), ival: 0, fval: 0.0, sval: String::new() }
    }

    pub fn set_int(&mut self, value: u32) {
        if let SlotKind::Host(host) = &self.kind {
            host.borrow_mut().set(&fmt_int(value as i32));
            return;
        }
        self.fval = (value as i32) as f64;
        self.ival = value;
        self.sval.clear();
        self.kind = SlotKind::Int;
    }

    pub fn set_float(&mut self, value: f64) {
        if let SlotKind::Host(host) = &self.kind {
            host.borrow_mut().set(&fmt_float(value));
            return;
        }
        self.fval = value;
        self.ival = value as u32;
        self.sval.clear();
        self.kind = SlotKind::Float;
    }

    pub fn set_str(&mut self, value: &str) {
        if let SlotKind::Host(host) = &self.kind {
            host.borrow_mut().set(value);
            return;
        }
        // short strings keep live numeric views; long ones read as zero
        if value.len() < 256 {
            self.fval = parse_float(value);
            self.ival = parse_int(value) as u32;
        } else {
            self.fval = 0.0;
            self.ival = 0;
        }
        self.sval.clear();
        self.sval.push_str(value);
        self.kind = SlotKind::Str;
    }

    pub fn get_int(&self) -> u32 {
        match &self.kind {
            SlotKind::Host(host) => parse_int(&host.borrow().get()) as u32,
            _ => self.ival,
        }
    }

    pub fn get_float(&self) -> f64 {
        match &self.kind {
            SlotKind::Host(host) => parse_float(&host.borrow().get()),
            _ => self.fval,
        }
    }

    pub fn get_str(&self) -> String {
        match &self.kind {
            SlotKind::Host(host) => host.borrow().get(),
            SlotKind::Str => self.sval.clone(),
            SlotKind::Int => fmt_int(self.ival as i32),
            SlotKind::Float => fmt_float(self.fval),
        }
    }
}


pub type Dictionary = HashMap<Ident, Slot>;

pub struct FrameData {
    pub vars: Dictionary,
    pub fn_name: Ident,
    pub namespace: Option<NsId>,
    pub code: Option<Rc<CodeBlock>>,
    pub ip: u32,
}

impl FrameData {
    fn new(fn_name: Ident, namespace: Option<NsId>) -> FrameData {
        FrameData { vars: Dictionary::new(), fn_name, namespace, code: None, ip: 0 }
    }
}

pub enum ScopeFrame {
    Owned(FrameData),
    Ref(usize),
}


// The per-step variable cursor: names a slot rather than borrowing it;
// access re-resolves.
#[derive(Clone, Debug, PartialEq)]
pub enum VarRef {
    None,
    Global(Ident),
    Local(usize, Ident),
}


pub struct ExecState {
    pub globals: Dictionary,
    frames: Vec<ScopeFrame>,
}

impl ExecState {
    pub fn new() -> ExecState {
        ExecState { globals: Dictionary::new(), frames: Vec::new() }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push_frame(&mut self, fn_name: Ident, namespace: Option<NsId>) {
        self.frames.push(ScopeFrame::Owned(FrameData::new(fn_name, namespace)));
    }

    // Push a shallow view of the frame at `index`; local writes land in
    // that frame's dictionary.
    pub fn push_frame_ref(&mut self, index: usize) {
        let target = self.resolve(index);
        self.frames.push(ScopeFrame::Ref(target));
    }

    pub fn pop_frame(&mut self) {
        self.frames.pop();
    }

    fn resolve(&self, index: usize) -> usize {
        match self.frames.get(index) {
            Some(ScopeFrame::Ref(target)) => *target,
            _ => index,
        }
    }

    pub fn top_index(&self) -> Option<usize> {
        if self.frames.is_empty() {
            None
        } else {
            Some(self.resolve(self.frames.len() - 1))
        }
    }

    pub fn frame(&self, index: usize) -> &FrameData {
        match &self.frames[index] {
            ScopeFrame::Owned(data) => data,
            ScopeFrame::Ref(_) => unreachable!("reference frames resolve at push"),
        }
    }

    pub fn frame_mut(&mut self, index: usize) -> &mut FrameData {
        match &mut self.frames[index] {
            ScopeFrame::Owned(data) => data,
            ScopeFrame::Ref(_) => unreachable!("reference frames resolve at push"),
        }
    }

    pub fn top_mut(&mut self) -> Option<&mut FrameData> {
        match self.top_index() {
            Some(index) => Some(self.frame_mut(index)),
            None => None,
        }
    }

    // Record the outgoing call site on the active frame for the debugger.
    pub fn record_call_site(&mut self, code: &Rc<CodeBlock>, ip: u32) {
        if let Some(top) = self.top_mut() {
            top.code = Some(Rc::clone(code));
            top.ip = ip;
        }
    }

    pub fn find_var(&self, name: Ident, global: bool) -> VarRef {
        if global {
            if self.globals.contains_key(&name) {
                return VarRef::Global(name);
            }
        } else if let Some(index) = self.top_index() {
            if self.frame(index).vars.contains_key(&name) {
                return VarRef::Local(index, name);
            }
        }
        VarRef::None
    }

    pub fn make_var(&mut self, name: Ident, global: bool) -> VarRef {
        if global {
            self.globals.entry(name).or_insert_with(Slot::new);
            VarRef::Global(name)
        } else if let Some(index) = self.top_index() {
            self.frame_mut(index).vars.entry(name).or_insert_with(Slot::new);
            VarRef::Local(index, name)
        } else {
            VarRef::None
        }
    }

    pub fn slot(&self, var: &VarRef) -> Option<&Slot> {
        match var {
            VarRef::None => None,
            VarRef::Global(name) => self.globals.get(name),
            VarRef::Local(index, name) => {
                if *index < self.frames.len() {
                    self.frame(*index).vars.get(name)
                } else {
                    None
                }
            }
        }
    }

    pub fn slot_mut(&mut self, var: &VarRef) -> Option<&mut Slot> {
        match var {
            VarRef::None => None,
            VarRef::Global(name) => self.globals.get_mut(name),
            VarRef::Local(index, name) => {
                if *index < self.frames.len() {
                    self.frame_mut(*index).vars.get_mut(name)
                } else {
                    None
                }
            }
        }
    }
}
