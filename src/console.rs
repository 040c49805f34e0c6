// The diagnostics surface and the tagged-string registry.
//
// Script faults never abort execution; they come out here, tagged with a
// severity and a channel, through whatever sink the host installed. The
// default sink forwards to the `log` facade.

use log::{error, info, warn};
use std::cell::RefCell;
use std::rc::Rc;


#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Channel {
    General,
    Script,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Severity {
    Print,
    Warn,
    Error,
}

pub trait ConsoleSink {
    fn emit(&mut self, severity: Severity, channel: Channel, message: &str);
}


pub struct LogSink;

impl ConsoleSink for LogSink {
    fn emit(&mut self, severity: Severity, channel: Channel, message: &str) {
        let target = match channel {
            Channel::General => "console",
            Channel::Script => "console::script",
        };
        match severity {
            Severity::Print => info!(target: target, "{}", message),
            Severity::Warn => warn!(target: target, "{}", message),
            Severity::Error => error!(target: target, "{}", message),
        }
    }
}


// Shared-handle sink that keeps everything emitted; tests hold the handle
// and assert on it after installing a clone in the interpreter.
#[derive(Clone, Default)]
pub struct Capture {
    lines: Rc<RefCell<Vec<(Severity, Channel, String)>>>,
}

impl Capture {
    pub fn new() -> Capture {
        Capture::default()
    }

    pub fn lines(&self) -> Vec<(Severity, Channel, String)> {
        self.lines.borrow().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.lines.borrow().iter().map(|l| l.2.clone()).collect()
    }

    pub fn contains(&self, fragment: &str) -> bool {
        self.lines.borrow().iter().any(|l| l.2.contains(fragment))
    }

    pub fn clear(&self) {
        self.lines.borrow_mut().clear();
    }
}

impl ConsoleSink for Capture {
    fn emit(&mut self, severity: Severity, channel: Channel, message: &str) {
        self.lines.borrow_mut().push((severity, channel, message.to_string()));
    }
}


// Compile-time string tags become runtime ids on first execution of the
// promoting opcode; the registry is the id space.
pub struct TaggedStrings {
    tags: Vec<String>,
}

impl TaggedStrings {
    pub fn new() -> TaggedStrings {
        TaggedStrings { tags: Vec::new() }
    }

    // Ids start at one; re-adding a known string returns the same id.
    pub fn add(&mut self, value: &str) -> u32 {
        if let Some(at) = self.tags.iter().position(|t| t == value) {
            return at as u32 + 1;
        }
        self.tags.push(value.to_string());
        self.tags.len() as u32
    }

    pub fn get(&self, id: u32) -> Option<&str> {
        if id == 0 {
            return None;
        }
        self.tags.get(id as usize - 1).map(|s| s.as_str())
    }
}


pub struct Console {
    sink: Box<dyn ConsoleSink>,
    pub tags: TaggedStrings,
}

impl Console {
    pub fn new() -> Console {
        Console { sink: Box::new(LogSink), tags: TaggedStrings::new() }
    }

    pub fn set_sink(&mut self, sink: Box<dyn ConsoleSink>) {
        self.sink = sink;
    }

    pub fn print(&mut self, channel: Channel, message: &str) {
        self.sink.emit(Severity::Print, channel, message);
    }

    pub fn warn(&mut self, channel: Channel, message: &str) {
        self.sink.emit(Severity::Warn, channel, message);
    }

    pub fn error(&mut self, channel: Channel, message: &str) {
        self.sink.emit(Severity::Error, channel, message);
    }
}
