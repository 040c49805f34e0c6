// Hook for an attached script debugger.
//
// The interpreter notifies on frame push/pop and stops at patched-in
// breakpoints; between those calls the debugger owns the conversation.

use std::rc::Rc;

use crate::codeblock::CodeBlock;


pub trait Debugger {
    fn push_stack_frame(&mut self);
    fn pop_stack_frame(&mut self);
    fn execution_stopped(&mut self, block: &Rc<CodeBlock>, line: u32);
}
