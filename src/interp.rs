// (C) 2019 Brandon Lewis
//
// The interpreter driver.
//
// A compiled code block is executed from a caller-chosen offset: the top of
// a file, or the entry of a function declared inside one. Execution walks
// the instruction words, reading operands from the three workspaces and the
// instruction stream, until a return, an invalid word, or a fatal workspace
// fault. Script-level failures are diagnostics or compiler-provided fail
// jumps; nothing here unwinds the host.
//
// *Values*
//
// The language is string-centric. Every call produces a string (the current
// slice of the string workspace); the integer and float stacks only carry
// intermediate results between coercion opcodes emitted by the compiler.
//
// *Re-entrancy*
//
// Script functions calling script functions recurse through exec. The
// per-activation cursors (current variable, object, field, in-construction
// object, fail target) are locals of the dispatch loop, so a nested
// activation cannot disturb its caller's. Engine-global state that a call
// must not leak (current file, the "this" object) is saved and restored
// around the nested activation.
//
// *Self-patching code*
//
// Two opcodes rewrite their own call site on first execution: TagToStr
// becomes LoadImmedStr once the literal has a runtime tag id, and
// CallFuncResolve becomes CallFunc with the resolved entry's arena index
// patched into its operand word. Both rewrites are idempotent and monotonic;
// later executions take the direct path.

use std::cell::RefCell;
use std::rc::Rc;

use crate::builtins;
use crate::codeblock::CodeBlock;
use crate::config::Settings;
use crate::console::{Channel, Console, ConsoleSink};
use crate::debugger::Debugger;
use crate::ident::{Ident, IdentTable};
use crate::namespace::{Entry, EntryId, EntryKind, HostFn, Namespaces, NsId};
use crate::opcode::Op;
use crate::scope::{ExecState, HostValue, Slot, VarRef};
use crate::sim::{ObjectFlag, ObjectId, Sim};
use crate::stacks::{Fault, FloatStack, IntStack, StringStack};
use crate::util::{fmt_float, fmt_int, parse_float, parse_int};


// Call modes decoded from a CallFunc operand word.
pub const CALL_FUNCTION: u32 = 0;
pub const CALL_METHOD: u32 = 1;
pub const CALL_PARENT: u32 = 2;


// Everything a function activation needs to know about how it was called.
// argv[0] is the function name; the rest are the actual arguments.
pub struct CallInfo {
    pub name: Ident,
    pub namespace: Option<NsId>,
    pub package: Ident,
    pub argv: Vec<String>,
}

enum HostResult {
    Int(i32),
    Float(f64),
}


pub struct Interp {
    pub idents: IdentTable,
    pub namespaces: Namespaces,
    pub state: ExecState,
    pub sim: Sim,
    pub console: Console,
    pub settings: Settings,
    ints: IntStack,
    floats: FloatStack,
    strs: StringStack,
    debugger: Option<Box<dyn Debugger>>,
    this_object: Option<ObjectId>,
    current_file: Option<String>,
    current_root: Option<String>,
}

impl Interp {
    pub fn new() -> Interp {
        Interp::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Interp {
        let mut idents = IdentTable::new();
        let mut namespaces = Namespaces::new();
        let sim = Sim::new(&mut idents, &mut namespaces);
        let mut interp = Interp {
            ints: IntStack::new(settings.int_stack_depth),
            floats: FloatStack::new(settings.float_stack_depth),
            strs: StringStack::new(),
            idents,
            namespaces,
            state: ExecState::new(),
            sim,
            console: Console::new(),
            settings,
            debugger: None,
            this_object: None,
            current_file: None,
            current_root: None,
        };
        builtins::register_core_builtins(&mut interp);
        interp
    }

    pub fn set_sink(&mut self, sink: Box<dyn ConsoleSink>) {
        self.console.set_sink(sink);
    }

    pub fn attach_debugger(&mut self, debugger: Box<dyn Debugger>) {
        self.debugger = Some(debugger);
    }

    pub fn detach_debugger(&mut self) -> Option<Box<dyn Debugger>> {
        self.debugger.take()
    }

    pub fn this_object(&self) -> Option<ObjectId> {
        self.this_object
    }

    pub fn current_file(&self) -> Option<&str> {
        self.current_file.as_deref()
    }

    pub fn get_variable(&mut self, name: &str) -> String {
        let id = self.idents.intern(name);
        self.state.globals.get(&id).map(|s| s.get_str()).unwrap_or_default()
    }

    pub fn set_variable(&mut self, name: &str, value: &str) {
        let id = self.idents.intern(name);
        self.state.globals.entry(id).or_insert_with(Slot::new).set_str(value);
    }

    // Bind a global to host-typed storage; reads and writes go through the
    // codec from then on.
    pub fn add_host_variable(&mut self, name: &str, value: Rc<RefCell<dyn HostValue>>) {
        let id = self.idents.intern(name);
        self.state.globals.insert(id, Slot::host(value));
    }

    pub fn activate_package(&mut self, name: &str) {
        let id = self.idents.intern(name);
        self.namespaces.activate_package(id);
    }

    pub fn deactivate_package(&mut self, name: &str) {
        let id = self.idents.intern(name);
        self.namespaces.deactivate_package(id);
    }

    pub fn printf(&mut self, channel: Channel, message: &str) {
        self.console.print(channel, message);
    }

    pub fn warnf(&mut self, channel: Channel, message: &str) {
        self.console.warn(channel, message);
    }

    pub fn errorf(&mut self, channel: Channel, message: &str) {
        self.console.error(channel, message);
    }

    // Run a block from the top: declarations bind, top-level code executes.
    pub fn exec_block(&mut self, block: &Rc<CodeBlock>) -> String {
        self.exec(block, 0, None, false, -1)
    }

    // Call a function in the global namespace by name.
    pub fn call_function(&mut self, name: &str, args: &[&str]) -> String {
        let fn_id = self.idents.intern(name);
        let global = self.namespaces.global();
        let entry = self
            .namespaces
            .lookup(global, fn_id)
            .and_then(|id| self.namespaces.entry(id).cloned());
        match entry {
            None => {
                self.warnf(Channel::General, &format!("Unknown command {}.", name));
                String::new()
            }
            Some(entry) => {
                let mut argv = vec![name.to_string()];
                argv.extend(args.iter().map(|s| s.to_string()));
                self.call_entry(entry, fn_id, argv)
            }
        }
    }

    fn call_entry(&mut self, entry: Entry, fn_id: Ident, argv: Vec<String>) -> String {
        match entry.kind {
            EntryKind::Script { code, offset } => {
                if offset == 0 {
                    return String::new();
                }
                let info = CallInfo {
                    name: fn_id,
                    namespace: Some(entry.namespace),
                    package: entry.package,
                    argv,
                };
                self.exec(&code, offset, Some(info), false, -1)
            }
            EntryKind::Host { func, min_args, max_args, usage } => {
                let argc = argv.len() as u32;
                if (min_args > 0 && argc < min_args) || (max_args > 0 && argc > max_args) {
                    let name = self.idents.resolve(fn_id).to_string();
                    self.warnf(Channel::Script, &format!("{} - wrong number of arguments.", name));
                    self.warnf(Channel::Script, &format!("usage: {}", usage));
                    return String::new();
                }
                let this = self.this_object;
                match func {
                    HostFn::Str(callback) => callback(self, this, &argv),
                    HostFn::Int(callback) => fmt_int(callback(self, this, &argv)),
                    HostFn::Float(callback) => fmt_float(callback(self, this, &argv)),
                    HostFn::Void(callback) => {
                        callback(self, this, &argv);
                        String::new()
                    }
                    HostFn::Bool(callback) => fmt_int(callback(self, this, &argv) as i32),
                }
            }
        }
    }

    // Execute `block` starting at `start`.
    //
    // `call` carries the argument vector for a function activation; without
    // it this is a top-level (or eval) activation and `set_frame` picks the
    // frame policy: negative pushes a fresh frame, non-negative pushes a
    // reference to the frame at that depth from the top.
    pub fn exec(
        &mut self,
        block: &Rc<CodeBlock>,
        start: u32,
        call: Option<CallInfo>,
        no_calls: bool,
        set_frame: i32,
    ) -> String {
        let block = Rc::clone(block);
        let mut ip = start;
        let mut fn_scope = false;
        let mut pop_frame = false;
        let mut this_namespace = None;
        let mut traced = false;

        if let Some(info) = &call {
            // `start` points at a function declaration header
            let fn_argc = block.word_or(start + 5, 0);
            let fn_name = Ident(block.word_or(start, 0));
            let argc = (info.argv.len().saturating_sub(1) as u32).min(fn_argc);
            this_namespace = info.namespace;
            if self.settings.trace {
                traced = true;
                let mut line = String::from("Entering ");
                if !info.package.is_empty() {
                    line.push_str(&format!("[{}]", self.idents.resolve(info.package)));
                }
                match self.namespace_label(info.namespace) {
                    Some(ns) => line.push_str(&format!("{}::{}(", ns, self.idents.resolve(fn_name))),
                    None => line.push_str(&format!("{}(", self.idents.resolve(fn_name))),
                }
                line.push_str(&info.argv[1..argc as usize + 1].join(", "));
                line.push(')');
                self.printf(Channel::General, &line);
            }
            self.state.push_frame(fn_name, info.namespace);
            pop_frame = true;
            for i in 0..argc {
                let formal = Ident(block.word_or(start + 6 + i, 0));
                let var = self.state.make_var(formal, false);
                if let Some(slot) = self.state.slot_mut(&var) {
                    slot.set_str(&info.argv[i as usize + 1]);
                }
            }
            ip = start + 6 + fn_argc;
            fn_scope = true;
        } else if set_frame < 0 {
            self.state.push_frame(Ident::EMPTY, None);
            pop_frame = true;
        } else if self.state.depth() > 0 {
            let depth = self.state.depth();
            let index = depth - 1 - (set_frame as usize).min(depth - 1);
            self.state.push_frame_ref(index);
            pop_frame = true;
        }

        if set_frame < 0 {
            if let Some(debugger) = self.debugger.as_mut() {
                debugger.push_stack_frame();
            }
        }

        let saved_file = self.current_file.clone();
        let saved_root = self.current_root.clone();
        if block.name.is_some() {
            self.current_file = block.name.clone();
            self.current_root = block.root.clone();
        }

        if let Err(fault) = self.run(&block, ip, &call, no_calls, fn_scope, this_namespace) {
            let name = block.name.clone().unwrap_or_else(|| "<eval>".to_string());
            self.errorf(Channel::General, &format!("{}: {}", name, fault));
        }

        if set_frame < 0 {
            if let Some(debugger) = self.debugger.as_mut() {
                debugger.pop_stack_frame();
            }
        }
        if pop_frame {
            self.state.pop_frame();
        }
        if let Some(info) = &call {
            if traced {
                let mut line = String::from("Leaving ");
                if !info.package.is_empty() {
                    line.push_str(&format!("[{}]", self.idents.resolve(info.package)));
                }
                let value = self.strs.value();
                match self.namespace_label(info.namespace) {
                    Some(ns) => line.push_str(&format!(
                        "{}::{}() - return {}",
                        ns,
                        self.idents.resolve(info.name),
                        value
                    )),
                    None => line.push_str(&format!(
                        "{}() - return {}",
                        self.idents.resolve(info.name),
                        value
                    )),
                }
                self.printf(Channel::General, &line);
            }
        } else {
            // the global tables only serve the one top-level pass
            block.release_global_tables();
        }
        self.current_file = saved_file;
        self.current_root = saved_root;
        self.strs.value()
    }

    fn namespace_label(&self, ns: Option<NsId>) -> Option<String> {
        let name = self.idents.resolve(self.namespaces.name(ns?));
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }

    fn run(
        &mut self,
        block: &Rc<CodeBlock>,
        mut ip: u32,
        call: &Option<CallInfo>,
        no_calls: bool,
        fn_scope: bool,
        this_namespace: Option<NsId>,
    ) -> Result<(), Fault> {
        // per-activation cursors
        let mut cur_var = VarRef::None;
        let mut cur_object: Option<ObjectId> = None;
        let mut new_object: Option<ObjectId> = None;
        let mut cur_field = Ident::EMPTY;
        let mut cur_field_array = String::new();
        let mut fail_jump: u32 = 0;

        loop {
            let mut instruction = block.word(ip)?;
            ip += 1;
            // breakpoints and TagToStr re-enter dispatch with a substituted word
            loop {
                match Op::from_word(instruction) {
                    Op::FuncDecl => {
                        if !no_calls {
                            let fn_name = Ident(block.word(ip)?);
                            let fn_ns = Ident(block.word(ip + 1)?);
                            let fn_pkg = Ident(block.word(ip + 2)?);
                            let has_body = block.word(ip + 3)? != 0;
                            self.namespaces.unlink_packages();
                            let ns = self.namespaces.find_in_package(fn_ns, fn_pkg);
                            self.namespaces.add_script_function(
                                ns,
                                fn_name,
                                Rc::clone(block),
                                if has_body { ip } else { 0 },
                            );
                            self.namespaces.relink_packages();
                        }
                        ip = block.word(ip + 4)?;
                    }

                    Op::CreateObject => {
                        self.op_create_object(block, &mut ip, &mut fail_jump, &mut new_object, no_calls)?
                    }
                    Op::AddObject => self.op_add_object(block, &mut ip, new_object, fail_jump)?,
                    Op::EndObject => {
                        let place_at_root = block.word(ip)? != 0;
                        ip += 1;
                        if !place_at_root {
                            self.ints.pop()?;
                        }
                    }

                    Op::JmpIffNot => {
                        ip = if self.floats.pop()? != 0.0 { ip + 1 } else { block.word(ip)? }
                    }
                    Op::JmpIfNot => {
                        ip = if self.ints.pop()? != 0 { ip + 1 } else { block.word(ip)? }
                    }
                    Op::JmpIff => {
                        ip = if self.floats.pop()? == 0.0 { ip + 1 } else { block.word(ip)? }
                    }
                    Op::JmpIf => {
                        ip = if self.ints.pop()? == 0 { ip + 1 } else { block.word(ip)? }
                    }
                    // the "no pop" pair keeps the operand when the branch is
                    // taken; that value is the short-circuit result
                    Op::JmpIfNotNp => {
                        if self.ints.top()? != 0 {
                            self.ints.pop()?;
                            ip += 1;
                        } else {
                            ip = block.word(ip)?;
                        }
                    }
                    Op::JmpIfNp => {
                        if self.ints.top()? == 0 {
                            self.ints.pop()?;
                            ip += 1;
                        } else {
                            ip = block.word(ip)?;
                        }
                    }
                    Op::Jmp => ip = block.word(ip)?,
                    Op::Return => return Ok(()),

                    Op::CmpEq => {
                        let (a, b) = self.float_pair()?;
                        self.ints.push((a == b) as u32)?;
                    }
                    Op::CmpGr => {
                        let (a, b) = self.float_pair()?;
                        self.ints.push((a > b) as u32)?;
                    }
                    Op::CmpGe => {
                        let (a, b) = self.float_pair()?;
                        self.ints.push((a >= b) as u32)?;
                    }
                    Op::CmpLt => {
                        let (a, b) = self.float_pair()?;
                        self.ints.push((a < b) as u32)?;
                    }
                    Op::CmpLe => {
                        let (a, b) = self.float_pair()?;
                        self.ints.push((a <= b) as u32)?;
                    }
                    Op::CmpNe => {
                        let (a, b) = self.float_pair()?;
                        self.ints.push((a != b) as u32)?;
                    }

                    Op::Xor => {
                        let (a, b) = self.int_pair()?;
                        self.ints.push(a ^ b)?;
                    }
                    Op::Mod => {
                        let (a, b) = self.int_pair()?;
                        self.ints.push(if b == 0 { 0 } else { a % b })?;
                    }
                    Op::BitAnd => {
                        let (a, b) = self.int_pair()?;
                        self.ints.push(a & b)?;
                    }
                    Op::BitOr => {
                        let (a, b) = self.int_pair()?;
                        self.ints.push(a | b)?;
                    }
                    Op::Not => {
                        let a = self.ints.pop()?;
                        self.ints.push((a == 0) as u32)?;
                    }
                    Op::NotF => {
                        let a = self.floats.pop()?;
                        self.ints.push((a == 0.0) as u32)?;
                    }
                    Op::OnesComplement => {
                        let a = self.ints.pop()?;
                        self.ints.push(!a)?;
                    }
                    Op::Shr => {
                        let (a, b) = self.int_pair()?;
                        self.ints.push(a.wrapping_shr(b))?;
                    }
                    Op::Shl => {
                        let (a, b) = self.int_pair()?;
                        self.ints.push(a.wrapping_shl(b))?;
                    }
                    Op::And => {
                        let (a, b) = self.int_pair()?;
                        self.ints.push((a != 0 && b != 0) as u32)?;
                    }
                    Op::Or => {
                        let (a, b) = self.int_pair()?;
                        self.ints.push((a != 0 || b != 0) as u32)?;
                    }

                    Op::Add => {
                        let (a, b) = self.float_pair()?;
                        self.floats.push(a + b)?;
                    }
                    Op::Sub => {
                        let (a, b) = self.float_pair()?;
                        self.floats.push(a - b)?;
                    }
                    Op::Mul => {
                        let (a, b) = self.float_pair()?;
                        self.floats.push(a * b)?;
                    }
                    Op::Div => {
                        let (a, b) = self.float_pair()?;
                        self.floats.push(a / b)?;
                    }
                    Op::Neg => {
                        let a = self.floats.pop()?;
                        self.floats.push(-a)?;
                    }

                    Op::SetCurVar => {
                        let name = Ident(block.word(ip)?);
                        ip += 1;
                        cur_var = self.set_cur_var(name, false);
                    }
                    Op::SetCurVarCreate => {
                        let name = Ident(block.word(ip)?);
                        ip += 1;
                        cur_var = self.set_cur_var(name, true);
                    }
                    Op::SetCurVarArray => {
                        let name = {
                            let text = self.strs.value();
                            self.idents.intern(&text)
                        };
                        cur_var = self.set_cur_var(name, false);
                    }
                    Op::SetCurVarArrayCreate => {
                        let name = {
                            let text = self.strs.value();
                            self.idents.intern(&text)
                        };
                        cur_var = self.set_cur_var(name, true);
                    }
                    Op::LoadVarUint => {
                        let value = self.state.slot(&cur_var).map_or(0, |s| s.get_int());
                        self.ints.push(value)?;
                    }
                    Op::LoadVarFlt => {
                        let value = self.state.slot(&cur_var).map_or(0.0, |s| s.get_float());
                        self.floats.push(value)?;
                    }
                    Op::LoadVarStr => {
                        let value =
                            self.state.slot(&cur_var).map(|s| s.get_str()).unwrap_or_default();
                        self.strs.set_value(&value);
                    }
                    Op::SaveVarUint => {
                        let value = self.ints.pop()?;
                        if let Some(slot) = self.state.slot_mut(&cur_var) {
                            slot.set_int(value);
                        }
                    }
                    Op::SaveVarFlt => {
                        let value = self.floats.pop()?;
                        if let Some(slot) = self.state.slot_mut(&cur_var) {
                            slot.set_float(value);
                        }
                    }
                    Op::SaveVarStr => {
                        let value = self.strs.value();
                        if let Some(slot) = self.state.slot_mut(&cur_var) {
                            slot.set_str(&value);
                        }
                    }

                    Op::SetCurObject => {
                        let spec = self.strs.value();
                        cur_object = self.sim.find_object(&spec);
                    }
                    Op::SetCurObjectNew => cur_object = new_object,
                    Op::SetCurField => {
                        cur_field = Ident(block.word(ip)?);
                        ip += 1;
                        cur_field_array.clear();
                    }
                    Op::SetCurFieldArray => cur_field_array = self.strs.value(),
                    Op::LoadFieldUint => {
                        let value = self.data_field(cur_object, cur_field, &cur_field_array);
                        self.ints.push(parse_int(&value) as u32)?;
                    }
                    Op::LoadFieldFlt => {
                        let value = self.data_field(cur_object, cur_field, &cur_field_array);
                        self.floats.push(parse_float(&value))?;
                    }
                    Op::LoadFieldStr => {
                        let value = self.data_field(cur_object, cur_field, &cur_field_array);
                        self.strs.set_value(&value);
                    }
                    Op::SaveFieldUint => {
                        let value = self.ints.pop()?;
                        self.strs.set_int(value as i32);
                        let text = self.strs.value();
                        self.save_data_field(cur_object, cur_field, &cur_field_array, &text);
                    }
                    Op::SaveFieldFlt => {
                        let value = self.floats.pop()?;
                        self.strs.set_float(value);
                        let text = self.strs.value();
                        self.save_data_field(cur_object, cur_field, &cur_field_array, &text);
                    }
                    Op::SaveFieldStr => {
                        let text = self.strs.value();
                        self.save_data_field(cur_object, cur_field, &cur_field_array, &text);
                    }

                    Op::StrToUint => {
                        let value = parse_int(&self.strs.value()) as u32;
                        self.ints.push(value)?;
                    }
                    Op::StrToFlt => {
                        let value = parse_float(&self.strs.value());
                        self.floats.push(value)?;
                    }
                    // exists to discard a string result in a typecast position
                    Op::StrToNone => {}
                    Op::FltToUint => {
                        let value = self.floats.pop()?;
                        self.ints.push(value as u32)?;
                    }
                    Op::FltToStr => {
                        let value = self.floats.pop()?;
                        self.strs.set_float(value);
                    }
                    Op::FltToNone => {
                        self.floats.pop()?;
                    }
                    Op::UintToFlt => {
                        let value = self.ints.pop()?;
                        self.floats.push(value as f64)?;
                    }
                    Op::UintToStr => {
                        let value = self.ints.pop()?;
                        self.strs.set_int(value as i32);
                    }
                    Op::UintToNone => {
                        self.ints.pop()?;
                    }

                    Op::LoadImmedUint => {
                        let value = block.word(ip)?;
                        ip += 1;
                        self.ints.push(value)?;
                    }
                    Op::LoadImmedFlt => {
                        let index = block.word(ip)?;
                        ip += 1;
                        self.floats.push(block.float_at(fn_scope, index))?;
                    }
                    Op::TagToStr => {
                        block.patch_word(ip - 1, Op::LoadImmedStr.word());
                        let offset = block.word(ip)?;
                        let tags = &mut self.console.tags;
                        block.promote_tag(fn_scope, offset, |literal| tags.add(literal));
                        instruction = Op::LoadImmedStr.word();
                        continue;
                    }
                    Op::LoadImmedStr => {
                        let offset = block.word(ip)?;
                        ip += 1;
                        let value = block.string_at(fn_scope, offset);
                        self.strs.set_value(&value);
                    }
                    Op::LoadImmedIdent => {
                        let id = Ident(block.word(ip)?);
                        ip += 1;
                        let value = self.idents.resolve(id).to_string();
                        self.strs.set_value(&value);
                    }

                    Op::CallFuncResolve => {
                        self.op_call_func(block, &mut ip, true, call, this_namespace, no_calls)?
                    }
                    Op::CallFunc => {
                        self.op_call_func(block, &mut ip, false, call, this_namespace, no_calls)?
                    }

                    Op::AdvanceStr => self.strs.advance(),
                    Op::AdvanceStrAppendChar => {
                        let sep = block.word(ip)? as u8;
                        ip += 1;
                        self.strs.advance_char(sep);
                    }
                    Op::AdvanceStrComma => self.strs.advance_char(b'_'),
                    Op::AdvanceStrNul => self.strs.advance_char(0),
                    Op::RewindStr => self.strs.rewind(),
                    Op::TerminateRewindStr => self.strs.terminate_rewind(),
                    Op::CompareStr => {
                        let equal = self.strs.compare();
                        self.ints.push(equal as u32)?;
                    }
                    Op::Push => {
                        let sep = block.word(ip)? as u8;
                        ip += 1;
                        self.strs.advance_char(sep);
                    }
                    Op::PushFrame => self.strs.push_frame(),

                    Op::Break => {
                        self.state.record_call_site(block, ip - 1);
                        if let Some((line, original)) = block.find_break_line(ip - 1) {
                            if line != 0 {
                                if let Some(mut debugger) = self.debugger.take() {
                                    debugger.execution_stopped(block, line);
                                    self.debugger = Some(debugger);
                                }
                            }
                            instruction = original;
                            continue;
                        }
                        // stray break word: no-op
                    }

                    Op::Invalid => return Err(Fault::InvalidOpcode(instruction)),
                }
                break;
            }
        }
    }

    fn int_pair(&mut self) -> Result<(u32, u32), Fault> {
        let a = self.ints.pop()?;
        let b = self.ints.pop()?;
        Ok((a, b))
    }

    fn float_pair(&mut self) -> Result<(f64, f64), Fault> {
        let a = self.floats.pop()?;
        let b = self.floats.pop()?;
        Ok((a, b))
    }

    fn set_cur_var(&mut self, name: Ident, create: bool) -> VarRef {
        let global = self.idents.resolve(name).starts_with('$');
        if create {
            let var = self.state.make_var(name, global);
            if var == VarRef::None {
                let text = self.idents.resolve(name).to_string();
                self.warnf(
                    Channel::Script,
                    &format!("Accessing local variable in global scope... failed: {}", text),
                );
            }
            var
        } else {
            let var = self.state.find_var(name, global);
            if var == VarRef::None && self.settings.warn_undefined_variables {
                let text = self.idents.resolve(name).to_string();
                self.warnf(
                    Channel::Script,
                    &format!("Variable referenced before assignment: {}", text),
                );
            }
            var
        }
    }

    fn data_field(&self, object: Option<ObjectId>, field: Ident, array: &str) -> String {
        object
            .and_then(|id| self.sim.object(id))
            .map(|o| o.get_data_field(&self.idents, field, array))
            .unwrap_or_default()
    }

    fn save_data_field(&mut self, object: Option<ObjectId>, field: Ident, array: &str, value: &str) {
        if let Some(id) = object {
            let idents = &self.idents;
            if let Some(object) = self.sim.object_mut(id) {
                object.set_data_field(idents, field, array, value);
            }
        }
    }

    fn object_label(&self, id: ObjectId) -> (String, String) {
        match self.sim.object(id) {
            Some(object) => (
                object.name.clone().unwrap_or_default(),
                object.class_name().to_string(),
            ),
            None => (String::new(), String::new()),
        }
    }

    fn op_create_object(
        &mut self,
        block: &Rc<CodeBlock>,
        ip: &mut u32,
        fail_jump: &mut u32,
        new_object: &mut Option<ObjectId>,
        no_calls: bool,
    ) -> Result<(), Fault> {
        let parent_name = Ident(block.word(*ip)?);
        let is_datablock = block.word(*ip + 1)? != 0;
        *fail_jump = block.word(*ip + 2)?;
        let site = block.file_line(*ip - 1);

        // the constructor arguments were assembled into the current string
        // frame ahead of this opcode; consume them either way
        let argv = self.strs.get_argc_argv("");
        if no_calls {
            *ip = *fail_jump;
            return Ok(());
        }

        let class_name = argv.get(1).cloned().unwrap_or_default();
        let object_name = argv.get(2).cloned().unwrap_or_default();
        *new_object = None;

        if is_datablock && !object_name.is_empty() {
            // re-declaring a known datablock reuses it
            if let Some(existing) = self.sim.find_member(self.sim.datablock_group(), &object_name) {
                let same_class = self
                    .sim
                    .object(existing)
                    .map_or(false, |o| o.class_name().eq_ignore_ascii_case(&class_name));
                if !same_class {
                    self.errorf(
                        Channel::General,
                        &format!(
                            "Cannot re-declare data block {} with a different class.",
                            object_name
                        ),
                    );
                    *ip = *fail_jump;
                    return Ok(());
                }
                *new_object = Some(existing);
            }
        }

        if new_object.is_none() {
            let class = match self.sim.find_class(&class_name) {
                Some(class) => class,
                None => {
                    self.errorf(
                        Channel::General,
                        &format!("{}: Unable to instantiate unknown class {}.", site, class_name),
                    );
                    *ip = *fail_jump;
                    return Ok(());
                }
            };
            if is_datablock && !class.is_datablock {
                self.errorf(
                    Channel::General,
                    &format!("{}: Unable to instantiate non-datablock class {}.", site, class_name),
                );
                *ip = *fail_jump;
                return Ok(());
            }
            let id = self.sim.create_object(&class);
            if !parent_name.is_empty() {
                let parent_text = self.idents.resolve(parent_name).to_string();
                match self.sim.find_object(&parent_text) {
                    Some(parent) => self.sim.assign_fields_from(id, parent),
                    None => self.errorf(
                        Channel::General,
                        &format!(
                            "{}: Unable to find parent object {} for {}.",
                            site, parent_text, class_name
                        ),
                    ),
                }
            }
            if !object_name.is_empty() {
                self.sim.assign_name(id, &object_name);
            }
            let ctor_args = if argv.len() > 3 { argv[3..].to_vec() } else { Vec::new() };
            let accepted = match self.sim.object_mut(id) {
                Some(object) => {
                    let hook = object.class.process_arguments;
                    hook(object, &ctor_args)
                }
                None => false,
            };
            if !accepted {
                self.sim.remove_object(id);
                *ip = *fail_jump;
                return Ok(());
            }
            if !is_datablock {
                if let Some(object) = self.sim.object_mut(id) {
                    object.flags.insert(ObjectFlag::ModStaticFields);
                    object.flags.insert(ObjectFlag::ModDynamicFields);
                }
            }
            *new_object = Some(id);
        }

        *ip += 3;
        Ok(())
    }

    fn op_add_object(
        &mut self,
        block: &Rc<CodeBlock>,
        ip: &mut u32,
        new_object: Option<ObjectId>,
        fail_jump: u32,
    ) -> Result<(), Fault> {
        let place_at_root = block.word(*ip)? != 0;
        let site = block.file_line(*ip - 1);
        *ip += 1;

        let id = match new_object {
            Some(id) => id,
            None => {
                *ip = fail_jump;
                return Ok(());
            }
        };

        let properly_added = self.sim.object(id).map_or(false, |o| o.is_properly_added());
        if !properly_added && !self.sim.register_object(id) {
            let (name, class) = self.object_label(id);
            self.warnf(
                Channel::General,
                &format!("{}: Register object failed for object {} of class {}.", site, name, class),
            );
            self.sim.remove_object(id);
            *ip = fail_jump;
            return Ok(());
        }

        if self.sim.object(id).map_or(false, |o| o.is_datablock()) {
            let preloaded = match self.sim.object_mut(id) {
                Some(object) => {
                    let hook = object.class.preload;
                    hook(object)
                }
                None => Ok(()),
            };
            if let Err(message) = preloaded {
                let (name, _) = self.object_label(id);
                self.errorf(
                    Channel::General,
                    &format!("{}: preload failed for {}: {}.", site, name, message),
                );
                self.sim.remove_object(id);
                *ip = fail_jump;
                return Ok(());
            }
        }

        let has_group = self.sim.object(id).and_then(|o| o.group).is_some();
        if !place_at_root || !has_group {
            let mut group = None;
            let mut set = None;
            if place_at_root {
                let instant = self.get_variable("$instantGroup");
                group = self.sim.find_object(&instant).filter(|&g| self.sim.is_group(g));
            } else {
                // the enclosing construction left the parent id on the stack
                let parent = self.ints.top().unwrap_or(0);
                if self.sim.is_group(parent) {
                    group = Some(parent);
                } else if self.sim.is_set(parent) {
                    set = Some(parent);
                }
            }
            let group = group.unwrap_or_else(|| self.sim.root_group());
            self.sim.add_to_group(group, id);
            if let Some(set) = set {
                self.sim.add_to_set(set, id);
            }
        }

        // the new id becomes the stack top: over the parent id slot if one
        // is there, pushed otherwise
        if place_at_root {
            if self.ints.depth() == 0 {
                self.ints.push(id)?;
            } else {
                self.ints.replace_top(id)?;
            }
        } else {
            self.ints.push(id)?;
        }
        Ok(())
    }

    fn op_call_func(
        &mut self,
        block: &Rc<CodeBlock>,
        ip: &mut u32,
        resolve: bool,
        call: &Option<CallInfo>,
        this_namespace: Option<NsId>,
        no_calls: bool,
    ) -> Result<(), Fault> {
        let fn_name_id = Ident(block.word(*ip)?);

        if resolve {
            let ns_name = Ident(block.word(*ip + 1)?);
            let ns = self.namespaces.find(ns_name);
            match self.namespaces.lookup(ns, fn_name_id) {
                Some(entry) => {
                    // patch the site: no lookup on the next execution
                    block.patch_word(*ip + 1, entry.0);
                    block.patch_word(*ip - 1, Op::CallFunc.word());
                }
                None => {
                    let site = block.file_line(*ip - 1);
                    *ip += 3;
                    let fn_name = self.idents.resolve(fn_name_id).to_string();
                    let ns_text = self.idents.resolve(ns_name).to_string();
                    let qualifier = if ns_text.is_empty() {
                        String::new()
                    } else {
                        format!("{}::", ns_text)
                    };
                    self.warnf(
                        Channel::General,
                        &format!("{}: Unable to find function {}{}", site, qualifier, fn_name),
                    );
                    self.strs.get_argc_argv(&fn_name);
                    self.strs.set_value("");
                    return Ok(());
                }
            }
        }

        let fn_name = self.idents.resolve(fn_name_id).to_string();
        let site = block.file_line(*ip - 1);
        self.state.record_call_site(block, *ip - 1);
        let entry_word = block.word(*ip + 1)?;
        let call_type = block.word(*ip + 2)?;
        *ip += 3;
        let argv = self.strs.get_argc_argv(&fn_name);

        let mut saved_this = None;
        let mut lookup_ns = None;
        let entry_id = match call_type {
            CALL_FUNCTION => Some(EntryId(entry_word)),
            CALL_METHOD => {
                saved_this = Some(self.this_object);
                let target = argv.get(1).map(|s| s.as_str()).unwrap_or("");
                match self.sim.find_object(target) {
                    None => {
                        self.this_object = None;
                        self.warnf(
                            Channel::General,
                            &format!(
                                "{}: Unable to find object: '{}' attempting to call function '{}'",
                                site, target, fn_name
                            ),
                        );
                        self.strs.set_value("");
                        self.this_object = saved_this.unwrap();
                        return Ok(());
                    }
                    Some(id) => {
                        self.this_object = Some(id);
                        let ns = self.sim.object(id).map(|o| o.namespace());
                        lookup_ns = ns;
                        ns.and_then(|ns| self.namespaces.lookup(ns, fn_name_id))
                    }
                }
            }
            _ => {
                let parent = this_namespace.and_then(|ns| self.namespaces.parent(ns));
                lookup_ns = parent;
                parent.and_then(|ns| self.namespaces.lookup(ns, fn_name_id))
            }
        };

        let entry = entry_id.and_then(|id| self.namespaces.entry(id).cloned());
        let entry = match entry {
            Some(entry) if !no_calls => entry,
            maybe => {
                if !no_calls && maybe.is_none() {
                    self.warnf(Channel::General, &format!("{}: Unknown command {}.", site, fn_name));
                    if call_type == CALL_METHOD {
                        let (name, _) = self
                            .this_object
                            .map(|id| self.object_label(id))
                            .unwrap_or_default();
                        let id_text =
                            self.this_object.map(|id| id.to_string()).unwrap_or_default();
                        let chain = match lookup_ns {
                            Some(ns) => {
                                let idents = &self.idents;
                                self.namespaces
                                    .chain_names(ns, |i| idents.resolve(i).to_string())
                            }
                            None => String::new(),
                        };
                        self.warnf(
                            Channel::General,
                            &format!("  Object {}({}) {}", name, id_text, chain),
                        );
                    }
                }
                self.strs.set_value("");
                if let Some(saved) = saved_this {
                    self.this_object = saved;
                }
                return Ok(());
            }
        };

        match entry.kind {
            EntryKind::Script { code, offset } => {
                if offset != 0 {
                    let info = CallInfo {
                        name: fn_name_id,
                        namespace: Some(entry.namespace),
                        package: entry.package,
                        argv,
                    };
                    self.exec(&code, offset, Some(info), false, -1);
                } else {
                    // declaration with no body
                    self.strs.set_value("");
                }
            }
            EntryKind::Host { func, min_args, max_args, usage } => {
                let argc = argv.len() as u32;
                if (min_args > 0 && argc < min_args) || (max_args > 0 && argc > max_args) {
                    let ns_text = match lookup_ns {
                        Some(ns) => self.idents.resolve(self.namespaces.name(ns)).to_string(),
                        None => String::new(),
                    };
                    self.warnf(
                        Channel::Script,
                        &format!("{}: {}::{} - wrong number of arguments.", site, ns_text, fn_name),
                    );
                    self.warnf(Channel::Script, &format!("{}: usage: {}", site, usage));
                } else {
                    let this = self.this_object;
                    match func {
                        HostFn::Str(callback) => {
                            let result = callback(self, this, &argv);
                            self.strs.set_value(&result);
                        }
                        HostFn::Int(callback) => {
                            let result = callback(self, this, &argv);
                            self.place_host_result(block, ip, HostResult::Int(result))?;
                        }
                        HostFn::Float(callback) => {
                            let result = callback(self, this, &argv);
                            self.place_host_result(block, ip, HostResult::Float(result))?;
                        }
                        HostFn::Bool(callback) => {
                            let result = callback(self, this, &argv);
                            self.place_host_result(block, ip, HostResult::Int(result as i32))?;
                        }
                        HostFn::Void(callback) => {
                            callback(self, this, &argv);
                            if Op::from_word(block.word_or(*ip, Op::Invalid.word()))
                                != Op::StrToNone
                            {
                                let caller = call
                                    .as_ref()
                                    .map(|c| self.idents.resolve(c.name).to_string())
                                    .unwrap_or_default();
                                self.warnf(
                                    Channel::General,
                                    &format!(
                                        "{}: Call to {} in {} uses result of void function call.",
                                        site, fn_name, caller
                                    ),
                                );
                            }
                            self.strs.set_value("");
                        }
                    }
                }
            }
        }

        if let Some(saved) = saved_this {
            self.this_object = saved;
        }
        Ok(())
    }

    // A numeric host result can skip the string workspace entirely when the
    // next opcode is the coercion the compiler emitted for it.
    fn place_host_result(
        &mut self,
        block: &Rc<CodeBlock>,
        ip: &mut u32,
        result: HostResult,
    ) -> Result<(), Fault> {
        match Op::from_word(block.word_or(*ip, Op::Invalid.word())) {
            Op::StrToUint => {
                *ip += 1;
                self.ints.push(match result {
                    HostResult::Int(v) => v as u32,
                    HostResult::Float(v) => v as u32,
                })?;
            }
            Op::StrToFlt => {
                *ip += 1;
                self.floats.push(match result {
                    HostResult::Int(v) => v as f64,
                    HostResult::Float(v) => v,
                })?;
            }
            Op::StrToNone => {
                *ip += 1;
            }
            _ => match result {
                HostResult::Int(v) => self.strs.set_int(v),
                HostResult::Float(v) => self.strs.set_float(v),
            },
        }
        Ok(())
    }
}


// These tests are written against the observable behavior of compiled
// programs: every one hand-assembles the words a compiler would emit and
// checks the value the activation produces, the diagnostics it logs, and
// the state it leaves behind.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::codeblock::CodeBlockBuilder;
    use crate::console::Capture;

    fn fixture() -> (Interp, Capture) {
        let mut interp = Interp::new();
        let capture = Capture::new();
        interp.set_sink(Box::new(capture.clone()));
        (interp, capture)
    }

    fn load_str(b: &mut CodeBlockBuilder, value: &str, fn_scope: bool) {
        let at = b.string_const(value, fn_scope);
        b.op(Op::LoadImmedStr).word(at);
    }

    fn load_float(b: &mut CodeBlockBuilder, value: f64, fn_scope: bool) {
        let at = b.float_const(value, fn_scope);
        b.op(Op::LoadImmedFlt).word(at);
    }

    fn push_arg(b: &mut CodeBlockBuilder) {
        b.op(Op::Push).word(0);
    }

    // Emit a function declaration header; the body follows, and the caller
    // patches the returned hole once the body's Return is emitted.
    fn declare_fn(
        b: &mut CodeBlockBuilder,
        name: Ident,
        ns: Ident,
        pkg: Ident,
        formals: &[Ident],
    ) -> usize {
        b.op(Op::FuncDecl);
        b.ident(name).ident(ns).ident(pkg).word(1);
        let end = b.hole();
        b.word(formals.len() as u32);
        for formal in formals {
            b.ident(*formal);
        }
        end
    }

    #[test]
    fn test_arithmetic_function() {
        // function f() { return 2 + 3 * 4; }  f();
        let (mut interp, _) = fixture();
        let f = interp.idents.intern("f");
        let mut b = CodeBlockBuilder::new(Some("math.cs"));
        let end = declare_fn(&mut b, f, Ident::EMPTY, Ident::EMPTY, &[]);
        load_float(&mut b, 3.0, true);
        load_float(&mut b, 4.0, true);
        b.op(Op::Mul);
        load_float(&mut b, 2.0, true);
        b.op(Op::Add);
        b.op(Op::FltToStr);
        b.op(Op::Return);
        b.patch_here(end);
        b.op(Op::Return);
        let block = b.finish();
        interp.exec_block(&block);
        assert_eq!(interp.call_function("f", &[]), "14");
        assert_eq!(interp.floats.depth(), 0);
    }

    #[test]
    fn test_branches_pop_their_operand() {
        let run = |condition: u32| {
            let (mut interp, _) = fixture();
            let mut b = CodeBlockBuilder::new(Some("branch.cs"));
            b.op(Op::LoadImmedUint).word(condition);
            b.op(Op::JmpIfNot);
            let alt = b.hole();
            load_str(&mut b, "taken", false);
            b.op(Op::Jmp);
            let end = b.hole();
            b.patch_here(alt);
            load_str(&mut b, "not taken", false);
            b.patch_here(end);
            b.op(Op::Return);
            let block = b.finish();
            let value = interp.exec_block(&block);
            assert_eq!(interp.ints.depth(), 0);
            value
        };
        assert_eq!(run(1), "taken");
        assert_eq!(run(0), "not taken");
    }

    #[test]
    fn test_short_circuit_keeps_operand() {
        // a && b via the no-pop branch: when a is zero it stays behind as
        // the expression value
        let run = |a: u32, b_val: u32| {
            let (mut interp, _) = fixture();
            let mut b = CodeBlockBuilder::new(Some("and.cs"));
            b.op(Op::LoadImmedUint).word(a);
            b.op(Op::JmpIfNotNp);
            let end = b.hole();
            b.op(Op::LoadImmedUint).word(b_val);
            b.patch_here(end);
            b.op(Op::UintToStr);
            b.op(Op::Return);
            let block = b.finish();
            let value = interp.exec_block(&block);
            assert_eq!(interp.ints.depth(), 0);
            value
        };
        assert_eq!(run(0, 5), "0");
        assert_eq!(run(2, 5), "5");
    }

    #[test]
    fn test_comparison_deltas() {
        // comparisons consume two floats and produce one int
        let (mut interp, _) = fixture();
        let mut b = CodeBlockBuilder::new(Some("cmp.cs"));
        load_float(&mut b, 3.0, false);
        load_float(&mut b, 2.0, false);
        b.op(Op::CmpGr);
        b.op(Op::Return);
        let block = b.finish();
        interp.exec_block(&block);
        assert_eq!(interp.floats.depth(), 0);
        assert_eq!(interp.ints.depth(), 1);
        // operand order: top compared against the one below it
        assert_eq!(interp.ints.pop(), Ok(0));
    }

    #[test]
    fn test_integer_ops() {
        let run = |emit: &dyn Fn(&mut CodeBlockBuilder)| {
            let (mut interp, _) = fixture();
            let mut b = CodeBlockBuilder::new(Some("int.cs"));
            emit(&mut b);
            b.op(Op::UintToStr);
            b.op(Op::Return);
            let block = b.finish();
            interp.exec_block(&block)
        };
        // result is top OP second
        assert_eq!(
            run(&|b| {
                b.op(Op::LoadImmedUint).word(3);
                b.op(Op::LoadImmedUint).word(8);
                b.op(Op::Shr);
            }),
            "1"
        );
        assert_eq!(
            run(&|b| {
                b.op(Op::LoadImmedUint).word(3);
                b.op(Op::LoadImmedUint).word(7);
                b.op(Op::Mod);
            }),
            "1"
        );
        // modulo by zero reads as zero instead of faulting
        assert_eq!(
            run(&|b| {
                b.op(Op::LoadImmedUint).word(0);
                b.op(Op::LoadImmedUint).word(7);
                b.op(Op::Mod);
            }),
            "0"
        );
        assert_eq!(
            run(&|b| {
                b.op(Op::LoadImmedUint).word(0);
                b.op(Op::Not);
            }),
            "1"
        );
    }

    #[test]
    fn test_float_divide_by_zero_continues() {
        let (mut interp, capture) = fixture();
        let mut b = CodeBlockBuilder::new(Some("div.cs"));
        load_float(&mut b, 0.0, false);
        load_float(&mut b, 1.0, false);
        b.op(Op::Div);
        b.op(Op::FltToStr);
        b.op(Op::Return);
        let block = b.finish();
        assert_eq!(interp.exec_block(&block), "inf");
        assert!(capture.lines().is_empty());
    }

    #[test]
    fn test_concat_and_compare() {
        // "a" SPC "b" $= "a b" -> 1
        let (mut interp, _) = fixture();
        let mut b = CodeBlockBuilder::new(Some("concat.cs"));
        load_str(&mut b, "a b", false);
        b.op(Op::AdvanceStrNul);
        load_str(&mut b, "a", false);
        b.op(Op::AdvanceStrAppendChar).word(u32::from(b' '));
        load_str(&mut b, "b", false);
        b.op(Op::RewindStr);
        b.op(Op::CompareStr);
        b.op(Op::UintToStr);
        b.op(Op::Return);
        let block = b.finish();
        assert_eq!(interp.exec_block(&block), "1");
        assert_eq!(interp.strs.offset_depth(), 0);
    }

    #[test]
    fn test_comma_separator_builds_array_keys() {
        let (mut interp, _) = fixture();
        let mut b = CodeBlockBuilder::new(Some("key.cs"));
        load_str(&mut b, "3", false);
        b.op(Op::AdvanceStrComma);
        load_str(&mut b, "4", false);
        b.op(Op::RewindStr);
        b.op(Op::Return);
        let block = b.finish();
        assert_eq!(interp.exec_block(&block), "3_4");
    }

    #[test]
    fn test_variable_views_and_globals() {
        let (mut interp, _) = fixture();
        let a = interp.idents.intern("%a");
        let g = interp.idents.intern("$g");
        let mut b = CodeBlockBuilder::new(Some("vars.cs"));
        b.op(Op::LoadImmedUint).word(7);
        b.op(Op::SetCurVarCreate).ident(a);
        b.op(Op::SaveVarUint);
        load_str(&mut b, "hi", false);
        b.op(Op::SetCurVarCreate).ident(g);
        b.op(Op::SaveVarStr);
        b.op(Op::SetCurVar).ident(a);
        b.op(Op::LoadVarFlt);
        b.op(Op::FltToStr);
        b.op(Op::Return);
        let block = b.finish();
        // the int write is visible through the float view
        assert_eq!(interp.exec_block(&block), "7");
        // globals survive the activation; locals died with the frame
        assert_eq!(interp.get_variable("$g"), "hi");
        assert_eq!(interp.state.find_var(a, false), VarRef::None);
    }

    #[test]
    fn test_array_variable_cursor() {
        let (mut interp, _) = fixture();
        let mut b = CodeBlockBuilder::new(Some("array.cs"));
        b.op(Op::LoadImmedUint).word(9);
        load_str(&mut b, "%arr", false);
        b.op(Op::AdvanceStr);
        load_str(&mut b, "3", false);
        b.op(Op::RewindStr);
        b.op(Op::SetCurVarArrayCreate);
        b.op(Op::SaveVarUint);
        load_str(&mut b, "%arr", false);
        b.op(Op::AdvanceStr);
        load_str(&mut b, "3", false);
        b.op(Op::RewindStr);
        b.op(Op::SetCurVarArray);
        b.op(Op::LoadVarUint);
        b.op(Op::UintToStr);
        b.op(Op::Return);
        let block = b.finish();
        assert_eq!(interp.exec_block(&block), "9");
    }

    #[test]
    fn test_undefined_read_warns_and_reads_empty() {
        let mut settings = Settings::default();
        settings.warn_undefined_variables = true;
        let mut interp = Interp::with_settings(settings);
        let capture = Capture::new();
        interp.set_sink(Box::new(capture.clone()));
        let missing = interp.idents.intern("%missing");
        let mut b = CodeBlockBuilder::new(Some("warn.cs"));
        b.op(Op::SetCurVar).ident(missing);
        b.op(Op::LoadVarStr);
        b.op(Op::Return);
        let block = b.finish();
        assert_eq!(interp.exec_block(&block), "");
        assert!(capture.contains("Variable referenced before assignment: %missing"));
    }

    #[test]
    fn test_missing_actuals_read_as_empty() {
        let (mut interp, _) = fixture();
        let g = interp.idents.intern("g");
        let pa = interp.idents.intern("%a");
        let pb = interp.idents.intern("%b");
        let mut b = CodeBlockBuilder::new(Some("args.cs"));
        let end = declare_fn(&mut b, g, Ident::EMPTY, Ident::EMPTY, &[pa, pb]);
        b.op(Op::SetCurVar).ident(pb);
        b.op(Op::LoadVarStr);
        b.op(Op::Return);
        b.patch_here(end);
        b.op(Op::Return);
        let block = b.finish();
        interp.exec_block(&block);
        assert_eq!(interp.call_function("g", &["x", "y"]), "y");
        assert_eq!(interp.call_function("g", &["x"]), "");
    }

    #[test]
    fn test_call_resolution_patches_and_peephole() {
        fn forty(_interp: &mut Interp, _this: Option<ObjectId>, _argv: &[String]) -> i32 {
            40
        }
        let (mut interp, _) = fixture();
        let name = interp.idents.intern("getForty");
        let global = interp.namespaces.global();
        interp
            .namespaces
            .add_host_function(global, name, HostFn::Int(forty), 0, 0, "getForty()");

        let mut b = CodeBlockBuilder::new(Some("call.cs"));
        b.op(Op::PushFrame);
        let call_at = b.here();
        b.op(Op::CallFuncResolve).ident(name).word(0).word(CALL_FUNCTION);
        b.op(Op::StrToUint);
        b.op(Op::UintToStr);
        b.op(Op::Return);
        let block = b.finish();

        // the integer result lands straight on the integer stack and the
        // coercion opcode is skipped
        assert_eq!(interp.exec_block(&block), "40");
        trace!("call site after first run: {:?}", block.word(call_at));
        // the site is rewritten to the direct form
        assert_eq!(block.word(call_at), Ok(Op::CallFunc.word()));
        // and the second run takes it without a lookup
        assert_eq!(interp.exec_block(&block), "40");
    }

    #[test]
    fn test_unknown_function_warns_and_yields_empty() {
        let (mut interp, capture) = fixture();
        let name = interp.idents.intern("noSuchThing");
        let mut b = CodeBlockBuilder::new(Some("missing.cs"));
        b.op(Op::PushFrame);
        load_str(&mut b, "arg", false);
        push_arg(&mut b);
        let call_at = b.here();
        b.op(Op::CallFuncResolve).ident(name).word(0).word(CALL_FUNCTION);
        b.op(Op::Return);
        let block = b.finish();
        assert_eq!(interp.exec_block(&block), "");
        assert!(capture.contains("Unable to find function noSuchThing"));
        // failure leaves the site unresolved but consumes the arguments
        assert_eq!(block.word(call_at), Ok(Op::CallFuncResolve.word()));
        assert_eq!(interp.strs.frame_depth(), 0);
    }

    #[test]
    fn test_method_dispatch_setname() {
        let (mut interp, _) = fixture();
        let class = interp.sim.find_class("SimObject").unwrap();
        let id = interp.sim.create_object(&class);
        interp.sim.register_object(id);
        interp.sim.assign_name(id, "Foo");

        let set_name = interp.idents.intern("setName");
        let mut b = CodeBlockBuilder::new(Some("method.cs"));
        b.op(Op::PushFrame);
        load_str(&mut b, "Foo", false);
        push_arg(&mut b);
        load_str(&mut b, "Bar", false);
        push_arg(&mut b);
        b.op(Op::CallFunc).ident(set_name).word(0).word(CALL_METHOD);
        b.op(Op::StrToNone);
        b.op(Op::Return);
        let block = b.finish();
        interp.exec_block(&block);
        assert_eq!(interp.sim.find_object("Bar"), Some(id));
        assert_eq!(interp.sim.find_object("Foo"), None);
        // "this" is restored around the method call
        assert_eq!(interp.this_object(), None);
    }

    #[test]
    fn test_method_on_missing_object_warns() {
        let (mut interp, capture) = fixture();
        let get_name = interp.idents.intern("getName");
        let mut b = CodeBlockBuilder::new(Some("missing.cs"));
        b.op(Op::PushFrame);
        load_str(&mut b, "Nobody", false);
        push_arg(&mut b);
        b.op(Op::CallFunc).ident(get_name).word(0).word(CALL_METHOD);
        b.op(Op::Return);
        let block = b.finish();
        assert_eq!(interp.exec_block(&block), "");
        assert!(capture.contains("Unable to find object: 'Nobody'"));
    }

    #[test]
    fn test_parent_call_without_parent_warns() {
        let (mut interp, capture) = fixture();
        let a = interp.idents.intern("A");
        let greet = interp.idents.intern("greet");
        let mut b = CodeBlockBuilder::new(Some("parent.cs"));
        let end = declare_fn(&mut b, greet, a, Ident::EMPTY, &[]);
        b.op(Op::PushFrame);
        b.op(Op::CallFunc).ident(greet).word(0).word(CALL_PARENT);
        b.op(Op::Return);
        b.patch_here(end);
        b.op(Op::Return);
        let block = b.finish();
        interp.exec_block(&block);

        let a_ns = interp.namespaces.find(a);
        let entry = interp
            .namespaces
            .lookup(a_ns, greet)
            .and_then(|id| interp.namespaces.entry(id).cloned())
            .unwrap();
        let value = interp.call_entry(entry, greet, vec!["greet".to_string()]);
        assert_eq!(value, "");
        assert!(capture.contains("Unknown command greet."));
    }

    #[test]
    fn test_parent_call_dispatches_up_the_chain() {
        let (mut interp, _) = fixture();
        let base = interp.idents.intern("Base");
        let derived = interp.idents.intern("Derived");
        let greet = interp.idents.intern("greet");
        let mut b = CodeBlockBuilder::new(Some("chain.cs"));
        let base_end = declare_fn(&mut b, greet, base, Ident::EMPTY, &[]);
        load_str(&mut b, "hello", true);
        b.op(Op::Return);
        b.patch_here(base_end);
        let derived_end = declare_fn(&mut b, greet, derived, Ident::EMPTY, &[]);
        b.op(Op::PushFrame);
        b.op(Op::CallFunc).ident(greet).word(0).word(CALL_PARENT);
        b.op(Op::Return);
        b.patch_here(derived_end);
        b.op(Op::Return);
        let block = b.finish();
        interp.exec_block(&block);

        let base_ns = interp.namespaces.find(base);
        let derived_ns = interp.namespaces.find(derived);
        interp.namespaces.set_parent(derived_ns, Some(base_ns));
        let entry = interp
            .namespaces
            .lookup(derived_ns, greet)
            .and_then(|id| interp.namespaces.entry(id).cloned())
            .unwrap();
        assert_eq!(interp.call_entry(entry, greet, vec!["greet".to_string()]), "hello");
    }

    #[test]
    fn test_object_construction() {
        // new SimObject(Foo) { x = 3; };
        let (mut interp, _) = fixture();
        let x = interp.idents.intern("x");
        let mut b = CodeBlockBuilder::new(Some("obj.cs"));
        b.op(Op::PushFrame);
        load_str(&mut b, "SimObject", false);
        push_arg(&mut b);
        load_str(&mut b, "Foo", false);
        push_arg(&mut b);
        b.op(Op::CreateObject).ident(Ident::EMPTY).word(0);
        let fail = b.hole();
        b.op(Op::SetCurObjectNew);
        b.op(Op::SetCurField).ident(x);
        load_str(&mut b, "3", false);
        b.op(Op::SaveFieldStr);
        b.op(Op::AddObject).word(1);
        b.op(Op::EndObject).word(1);
        b.op(Op::UintToNone);
        b.patch_here(fail);
        b.op(Op::Return);
        let block = b.finish();
        interp.exec_block(&block);

        let id = interp.sim.find_object("Foo").expect("Foo should exist");
        let object = interp.sim.object(id).unwrap();
        assert_eq!(object.get_data_field(&interp.idents, x, ""), "3");
        assert_eq!(object.group, Some(interp.sim.root_group()));
        assert_eq!(interp.ints.depth(), 0);
    }

    #[test]
    fn test_nested_construction_parents_through_the_stack() {
        let (mut interp, _) = fixture();
        let mut b = CodeBlockBuilder::new(Some("nest.cs"));
        b.op(Op::PushFrame);
        load_str(&mut b, "SimGroup", false);
        push_arg(&mut b);
        load_str(&mut b, "Outer", false);
        push_arg(&mut b);
        b.op(Op::CreateObject).ident(Ident::EMPTY).word(0);
        let fail_outer = b.hole();
        b.op(Op::AddObject).word(1);
        b.op(Op::PushFrame);
        load_str(&mut b, "SimObject", false);
        push_arg(&mut b);
        load_str(&mut b, "Inner", false);
        push_arg(&mut b);
        b.op(Op::CreateObject).ident(Ident::EMPTY).word(0);
        let fail_inner = b.hole();
        b.op(Op::AddObject).word(0);
        b.op(Op::EndObject).word(0);
        b.op(Op::EndObject).word(1);
        b.op(Op::UintToNone);
        b.patch_here(fail_outer);
        b.patch_here(fail_inner);
        b.op(Op::Return);
        let block = b.finish();
        interp.exec_block(&block);

        let outer = interp.sim.find_object("Outer").unwrap();
        let inner = interp.sim.find_object("Inner").unwrap();
        assert_eq!(interp.sim.object(inner).unwrap().group, Some(outer));
        assert_eq!(interp.sim.object(outer).unwrap().group, Some(interp.sim.root_group()));
        assert_eq!(interp.ints.depth(), 0);
    }

    fn datablock_program(class: &str, name: &str) -> Rc<CodeBlock> {
        let mut b = CodeBlockBuilder::new(Some("data.cs"));
        b.op(Op::PushFrame);
        load_str(&mut b, class, false);
        push_arg(&mut b);
        load_str(&mut b, name, false);
        push_arg(&mut b);
        b.op(Op::CreateObject).ident(Ident::EMPTY).word(1);
        let fail = b.hole();
        b.op(Op::AddObject).word(1);
        b.op(Op::EndObject).word(1);
        b.op(Op::UintToNone);
        b.patch_here(fail);
        b.op(Op::Return);
        b.finish()
    }

    #[test]
    fn test_datablock_reuse_and_class_mismatch() {
        let (mut interp, capture) = fixture();
        let first = datablock_program("SimDataBlock", "ArmorData");
        interp.exec_block(&first);
        let id = interp.sim.find_object("ArmorData").expect("datablock registered");
        assert_eq!(interp.sim.object(id).unwrap().group, Some(interp.sim.datablock_group()));

        // re-declaration with the same class reuses the instance
        let again = datablock_program("SimDataBlock", "ArmorData");
        interp.exec_block(&again);
        assert_eq!(interp.sim.find_object("ArmorData"), Some(id));

        // a different class is an error routed through the fail jump
        let wrong = datablock_program("SimObject", "ArmorData");
        interp.exec_block(&wrong);
        assert!(capture.contains("Cannot re-declare data block ArmorData"));
        assert_eq!(interp.sim.find_object("ArmorData"), Some(id));
        assert_eq!(interp.sim.object(id).unwrap().class_name(), "SimDataBlock");
        assert_eq!(interp.ints.depth(), 0);
    }

    #[test]
    fn test_instant_group_hook() {
        let (mut interp, _) = fixture();
        let group_class = interp.sim.find_class("SimGroup").unwrap();
        let stash = interp.sim.create_object(&group_class);
        interp.sim.register_object(stash);
        interp.sim.assign_name(stash, "Stash");
        interp.set_variable("$instantGroup", "Stash");

        let mut b = CodeBlockBuilder::new(Some("stash.cs"));
        b.op(Op::PushFrame);
        load_str(&mut b, "SimObject", false);
        push_arg(&mut b);
        load_str(&mut b, "Stored", false);
        push_arg(&mut b);
        b.op(Op::CreateObject).ident(Ident::EMPTY).word(0);
        let fail = b.hole();
        b.op(Op::AddObject).word(1);
        b.op(Op::EndObject).word(1);
        b.op(Op::UintToNone);
        b.patch_here(fail);
        b.op(Op::Return);
        let block = b.finish();
        interp.exec_block(&block);

        let stored = interp.sim.find_object("Stored").unwrap();
        assert_eq!(interp.sim.object(stored).unwrap().group, Some(stash));
    }

    #[test]
    fn test_field_ops_on_missing_object_read_zero() {
        let (mut interp, _) = fixture();
        let f = interp.idents.intern("anything");
        let mut b = CodeBlockBuilder::new(Some("field.cs"));
        load_str(&mut b, "NoSuchObj", false);
        b.op(Op::SetCurObject);
        b.op(Op::SetCurField).ident(f);
        b.op(Op::LoadFieldUint);
        b.op(Op::UintToStr);
        b.op(Op::Return);
        let block = b.finish();
        assert_eq!(interp.exec_block(&block), "0");
    }

    #[test]
    fn test_tag_promotion_is_idempotent() {
        let (mut interp, _) = fixture();
        let f = interp.idents.intern("taggy");
        let mut b = CodeBlockBuilder::new(Some("tag.cs"));
        let end = declare_fn(&mut b, f, Ident::EMPTY, Ident::EMPTY, &[]);
        let tag_at = b.here();
        let offset = b.tagged_const("~chatHello", true);
        b.op(Op::TagToStr).word(offset);
        b.op(Op::Return);
        b.patch_here(end);
        b.op(Op::Return);
        let block = b.finish();
        interp.exec_block(&block);

        let first = interp.call_function("taggy", &[]);
        assert_eq!(first, "\u{1}1");
        assert_eq!(block.word(tag_at), Ok(Op::LoadImmedStr.word()));
        // the patched form produces the same value with no re-registration
        assert_eq!(interp.call_function("taggy", &[]), first);
        assert_eq!(interp.console.tags.get(1), Some("~chatHello"));
        assert_eq!(interp.console.tags.get(2), None);
    }

    #[test]
    fn test_trace_logs_entry_and_return() {
        let mut settings = Settings::default();
        settings.trace = true;
        let mut interp = Interp::with_settings(settings);
        let capture = Capture::new();
        interp.set_sink(Box::new(capture.clone()));

        let f = interp.idents.intern("f");
        let mut b = CodeBlockBuilder::new(Some("trace.cs"));
        let end = declare_fn(&mut b, f, Ident::EMPTY, Ident::EMPTY, &[]);
        load_str(&mut b, "ok", true);
        b.op(Op::Return);
        b.patch_here(end);
        b.op(Op::Return);
        let block = b.finish();
        interp.exec_block(&block);
        assert_eq!(interp.call_function("f", &[]), "ok");
        assert!(capture.contains("Entering f()"));
        assert!(capture.contains("Leaving f() - return ok"));
    }

    #[test]
    fn test_invalid_opcode_exits_gracefully() {
        let (mut interp, capture) = fixture();
        let mut b = CodeBlockBuilder::new(Some("bad.cs"));
        b.op(Op::Invalid);
        let block = b.finish();
        assert_eq!(interp.exec_block(&block), "");
        assert!(capture.contains("invalid opcode"));
        // the frame pushed for the activation was popped on the way out
        assert_eq!(interp.state.depth(), 0);
    }

    #[test]
    fn test_reference_frame_writes_are_visible_at_depth() {
        let (mut interp, _) = fixture();
        let x = interp.idents.intern("%x");
        interp.state.push_frame(Ident::EMPTY, None);

        let mut b = CodeBlockBuilder::new(Some("ref.cs"));
        load_str(&mut b, "5", false);
        b.op(Op::SetCurVarCreate).ident(x);
        b.op(Op::SaveVarStr);
        b.op(Op::Return);
        let block = b.finish();
        interp.exec(&block, 0, None, false, 0);

        let var = interp.state.find_var(x, false);
        assert_eq!(interp.state.slot(&var).unwrap().get_str(), "5");
        interp.state.pop_frame();
    }

    #[test]
    fn test_package_declaration_shadows_when_active() {
        let (mut interp, _) = fixture();
        let f = interp.idents.intern("version");
        let pkg = interp.idents.intern("Patch");
        let mut b = CodeBlockBuilder::new(Some("pkg.cs"));
        let base_end = declare_fn(&mut b, f, Ident::EMPTY, Ident::EMPTY, &[]);
        load_str(&mut b, "base", true);
        b.op(Op::Return);
        b.patch_here(base_end);
        let patch_end = declare_fn(&mut b, f, Ident::EMPTY, pkg, &[]);
        load_str(&mut b, "patched", true);
        b.op(Op::Return);
        b.patch_here(patch_end);
        b.op(Op::Return);
        let block = b.finish();
        interp.exec_block(&block);

        assert_eq!(interp.call_function("version", &[]), "base");
        interp.activate_package("Patch");
        assert_eq!(interp.call_function("version", &[]), "patched");
        interp.deactivate_package("Patch");
        assert_eq!(interp.call_function("version", &[]), "base");
    }

    #[test]
    fn test_breakpoint_stops_and_resumes() {
        struct Probe {
            events: Rc<RefCell<Vec<String>>>,
        }
        impl Debugger for Probe {
            fn push_stack_frame(&mut self) {
                self.events.borrow_mut().push("push".to_string());
            }
            fn pop_stack_frame(&mut self) {
                self.events.borrow_mut().push("pop".to_string());
            }
            fn execution_stopped(&mut self, _block: &Rc<CodeBlock>, line: u32) {
                self.events.borrow_mut().push(format!("stop@{}", line));
            }
        }

        let (mut interp, _) = fixture();
        let events = Rc::new(RefCell::new(Vec::new()));
        interp.attach_debugger(Box::new(Probe { events: Rc::clone(&events) }));

        let mut b = CodeBlockBuilder::new(Some("debug.cs"));
        b.line(7);
        let bp = b.here();
        load_str(&mut b, "done", false);
        b.op(Op::Return);
        let block = b.finish();
        block.set_breakpoint(bp);

        assert_eq!(interp.exec_block(&block), "done");
        let seen = events.borrow().clone();
        assert_eq!(seen, vec!["push", "stop@7", "pop"]);
    }

    #[test]
    fn test_void_result_consumed_warns() {
        let (mut interp, capture) = fixture();
        let echo = interp.idents.intern("echo");
        let mut b = CodeBlockBuilder::new(Some("void.cs"));
        b.op(Op::PushFrame);
        load_str(&mut b, "hi", false);
        push_arg(&mut b);
        b.op(Op::CallFuncResolve).ident(echo).word(0).word(CALL_FUNCTION);
        b.op(Op::Return);
        let block = b.finish();
        assert_eq!(interp.exec_block(&block), "");
        assert!(capture.contains("hi"));
        assert!(capture.contains("uses result of void function call."));
    }

    #[test]
    fn test_host_arity_check_warns_with_usage() {
        let (mut interp, capture) = fixture();
        assert_eq!(interp.call_function("isObject", &[]), "");
        assert!(capture.contains("wrong number of arguments."));
        assert!(capture.contains("usage: isObject(object)"));
    }

    #[test]
    fn test_bool_host_result() {
        let (mut interp, _) = fixture();
        let class = interp.sim.find_class("SimObject").unwrap();
        let id = interp.sim.create_object(&class);
        interp.sim.register_object(id);
        interp.sim.assign_name(id, "Thing");
        assert_eq!(interp.call_function("isObject", &["Thing"]), "1");
        assert_eq!(interp.call_function("isObject", &["Other"]), "0");
    }

    #[test]
    fn test_host_variable_routes_through_codec() {
        struct Fov(String);
        impl HostValue for Fov {
            fn get(&self) -> String {
                self.0.clone()
            }
            fn set(&mut self, value: &str) {
                self.0 = value.to_string();
            }
        }

        let (mut interp, _) = fixture();
        let shared = Rc::new(RefCell::new(Fov("30".to_string())));
        interp.add_host_variable("$fov", shared.clone());
        let fov = interp.idents.intern("$fov");

        let mut b = CodeBlockBuilder::new(Some("host.cs"));
        b.op(Op::SetCurVar).ident(fov);
        b.op(Op::LoadVarUint);
        b.op(Op::UintToStr);
        b.op(Op::LoadImmedUint).word(90);
        b.op(Op::SetCurVar).ident(fov);
        b.op(Op::SaveVarUint);
        b.op(Op::Return);
        let block = b.finish();
        assert_eq!(interp.exec_block(&block), "30");
        assert_eq!(shared.borrow().0, "90");
    }

    #[test]
    fn test_load_immediate_ident() {
        let (mut interp, _) = fixture();
        let word = interp.idents.intern("Hello");
        let mut b = CodeBlockBuilder::new(Some("ident.cs"));
        b.op(Op::LoadImmedIdent).ident(word);
        b.op(Op::Return);
        let block = b.finish();
        assert_eq!(interp.exec_block(&block), "Hello");
    }

    #[test]
    fn test_field_array_suffix() {
        let (mut interp, _) = fixture();
        let class = interp.sim.find_class("SimObject").unwrap();
        let id = interp.sim.create_object(&class);
        interp.sim.register_object(id);
        interp.sim.assign_name(id, "Box");
        {
            let object = interp.sim.object_mut(id).unwrap();
            object.flags.insert(ObjectFlag::ModStaticFields);
            object.flags.insert(ObjectFlag::ModDynamicFields);
        }
        let f = interp.idents.intern("slot");

        let mut b = CodeBlockBuilder::new(Some("suffix.cs"));
        load_str(&mut b, "Box", false);
        b.op(Op::SetCurObject);
        b.op(Op::SetCurField).ident(f);
        load_str(&mut b, "2", false);
        b.op(Op::SetCurFieldArray);
        load_str(&mut b, "fifty", false);
        b.op(Op::SaveFieldStr);
        b.op(Op::SetCurField).ident(f);
        load_str(&mut b, "2", false);
        b.op(Op::SetCurFieldArray);
        b.op(Op::LoadFieldStr);
        b.op(Op::Return);
        let block = b.finish();
        assert_eq!(interp.exec_block(&block), "fifty");

        let object = interp.sim.object(id).unwrap();
        assert_eq!(object.get_data_field(&interp.idents, f, "2"), "fifty");
        assert_eq!(object.get_data_field(&interp.idents, f, ""), "");
    }

    #[test]
    fn test_no_calls_scans_structure_without_side_effects() {
        let (mut interp, _) = fixture();
        let f = interp.idents.intern("f");
        let mut b = CodeBlockBuilder::new(Some("nocalls.cs"));
        let end = declare_fn(&mut b, f, Ident::EMPTY, Ident::EMPTY, &[]);
        load_str(&mut b, "body", true);
        b.op(Op::Return);
        b.patch_here(end);
        b.op(Op::Return);
        let block = b.finish();
        interp.exec(&block, 0, None, true, -1);
        let global = interp.namespaces.global();
        assert_eq!(interp.namespaces.lookup(global, f), None);
    }
}
