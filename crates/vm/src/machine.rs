//! VM state: operand stack, execution context, globals, parser registry.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::rc::Rc;

use sprig_common::lang_el::{FIRST_USER_ID, ID_BOOL};
use sprig_common::{FrameInfo, FunctionInfo, Opcode, Program};
use tracing::debug;

use crate::error::RuntimeError;
use crate::iter::{Ref, TreeIter, UserIter};
use crate::pcr::{self, Action, DriverFactory, Pcr};
use crate::rcode::{self, RtCodeVect};
use crate::tree::{Heap, Payload, Tree, TreeRef};

/// Default maximum stack depth, in slots.
pub const MAX_STACK_DEPTH: usize = 4096;

/// `CALL` pushes a four-slot header below the callee's frame: return value,
/// return address, caller frame pointer, caller frame id. This is the
/// frame-relative offset of the return value slot.
pub(crate) const FR_RV: i16 = -4;

/// Runtime knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmOptions {
    pub max_stack_depth: usize,
    /// Program arguments exposed through `LOAD_ARGV`.
    pub argv: Vec<String>,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            max_stack_depth: MAX_STACK_DEPTH,
            argv: Vec::new(),
        }
    }
}

/// One operand stack entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Slot {
    #[default]
    Nil,
    /// An owned reference to a tree.
    Tree(TreeRef),
    Word(u64),
    /// A saved code offset.
    Ip(usize),
    /// A location: a stack slot plus a path into the tree it holds.
    Ref(Box<Ref>),
    UserIter(Box<UserIter>),
    TreeIter(Box<TreeIter>),
}

impl Slot {
    pub(crate) fn from_tree(tree: Option<TreeRef>) -> Slot {
        match tree {
            Some(t) => Slot::Tree(t),
            None => Slot::Nil,
        }
    }

    /// The tree held, without taking ownership.
    pub fn tree(&self) -> Option<TreeRef> {
        match self {
            Slot::Tree(t) => Some(*t),
            _ => None,
        }
    }
}

/// What the interpreter loop is currently running.
#[derive(Debug, Clone)]
pub(crate) struct Execution {
    /// Accumulator whose parse the code belongs to. Not owned.
    pub accum: Option<TreeRef>,
    pub frame_ptr: usize,
    /// Stack index just above the running user iterator's header.
    pub iframe_ptr: usize,
    pub frame_id: u16,
    /// Bytes in the reverse unit being built.
    pub unit_len: usize,
    pub code: Rc<[u8]>,
    pub ip: usize,
    /// Replaying reverse code: only reverse opcodes are legal.
    pub reverse: bool,
}

impl Execution {
    fn new(code: Rc<[u8]>, ip: usize, frame_ptr: usize) -> Self {
        Self {
            accum: None,
            frame_ptr,
            iframe_ptr: 0,
            frame_id: 0,
            unit_len: 0,
            code,
            ip,
            reverse: false,
        }
    }
}

/// How an instruction left the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    /// End the current block normally.
    Return,
    /// An exit was induced; unwind every level.
    Exit,
}

/// The sprig virtual machine.
pub struct Vm<'a> {
    pub(crate) program: &'a Program,
    pub(crate) code: Rc<[u8]>,
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Slot>,
    pub(crate) exec: Execution,
    /// Offset of the instruction being executed.
    pub(crate) at: usize,
    pub(crate) global: TreeRef,
    pub(crate) true_val: TreeRef,
    pub(crate) false_val: TreeRef,
    pub(crate) stdin: Option<TreeRef>,
    pub(crate) last_parse_error: Option<TreeRef>,
    pub(crate) parsers: HashMap<u16, DriverFactory>,
    pub(crate) options: VmOptions,
    pub(crate) output: Box<dyn Write>,
    pub(crate) induce_exit: bool,
    pub(crate) exit_status: i64,
}

impl fmt::Debug for Vm<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("heap", &self.heap)
            .field("stack", &self.stack.len())
            .field("exec", &self.exec)
            .field("induce_exit", &self.induce_exit)
            .finish_non_exhaustive()
    }
}

impl<'a> Vm<'a> {
    /// Create a VM for `program` with default options.
    pub fn new(program: &'a Program) -> Self {
        Self::with_options(program, VmOptions::default())
    }

    pub fn with_options(program: &'a Program, options: VmOptions) -> Self {
        let mut heap = Heap::new();
        let mut global = Tree::new(FIRST_USER_ID, Payload::Node);
        global.attrs = vec![None; program.global_size as usize];
        let global = heap.alloc(global);
        let true_val = heap.boolean(true);
        let false_val = heap.boolean(false);
        let code: Rc<[u8]> = Rc::from(program.code.as_slice());
        Self {
            program,
            exec: Execution::new(code.clone(), program.root_code, 0),
            code,
            heap,
            stack: Vec::new(),
            at: 0,
            global,
            true_val,
            false_val,
            stdin: None,
            last_parse_error: None,
            parsers: HashMap::new(),
            options,
            output: Box::new(io::stdout()),
            induce_exit: false,
            exit_status: 0,
        }
    }

    /// Send `PRINT` output to `out` instead of stdout.
    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.output = out;
    }

    /// Make `CONS_PARSER id` build accumulators around drivers from `factory`.
    pub fn register_parser(&mut self, id: u16, factory: DriverFactory) {
        self.parsers.insert(id, factory);
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn stack(&self) -> &[Slot] {
        &self.stack
    }

    /// The global object.
    pub fn global(&self) -> TreeRef {
        self.global
    }

    /// Status recorded by `EXIT`.
    pub fn exit_status(&self) -> i64 {
        self.exit_status
    }

    pub fn exit_induced(&self) -> bool {
        self.induce_exit
    }

    /// Push a host value, for arguments of host-driven frames.
    pub fn push_slot(&mut self, slot: Slot) -> Result<(), RuntimeError> {
        self.push(slot)
    }

    /// Pop a host value. Owned trees move to the caller.
    pub fn pop_slot(&mut self) -> Result<Slot, RuntimeError> {
        self.pop()
    }

    /// Run the root code to `STOP`, returning the exit status.
    pub fn run(&mut self) -> Result<i64, RuntimeError> {
        debug!(target: "sprig::vm", root = self.program.root_code, "run");
        let exec = Execution::new(self.code.clone(), self.program.root_code, self.stack.len());
        self.enter(exec)?;
        debug!(target: "sprig::vm", status = self.exit_status, "run finished");
        Ok(self.exit_status)
    }

    /// Run a frame's code on behalf of `accum`, with undo logging when
    /// `revert` is set.
    pub fn execute_frame(&mut self, accum: TreeRef, frame_id: u16, revert: bool) -> Result<(), RuntimeError> {
        let exec = self.frame_execution(accum, frame_id, revert)?;
        self.enter(exec)
    }

    /// Finalize what `accum` collected into one reverse group.
    pub fn make_reverse_code(&mut self, accum: TreeRef) -> Result<bool, RuntimeError> {
        self.heap.with_accum(accum, |_, a| a.run.make_reverse_code())
    }

    /// Replay the topmost reverse group of `accum`. False when there is none.
    pub fn revert_group(&mut self, accum: TreeRef) -> Result<bool, RuntimeError> {
        let group = self.heap.with_accum(accum, |_, a| Ok(a.run.reverse_code.pop_group()))?;
        let Some(group) = group else {
            return Ok(false);
        };
        debug!(target: "sprig::rcode", len = group.len(), "revert group");
        let exec = self.reverse_execution(accum, group);
        self.enter(exec)?;
        Ok(true)
    }

    /// Make everything `accum` did permanent, releasing captured trees.
    pub fn commit(&mut self, accum: TreeRef) -> Result<(), RuntimeError> {
        self.heap.with_accum(accum, |heap, a| {
            rcode::downref_collect(heap, &mut a.run.rcode_collect)?;
            rcode::downref_all(heap, &mut a.run.reverse_code)
        })
    }

    /// Drive a fragment parse to completion, running requested actions.
    pub fn parse_frag(&mut self, accum: TreeRef, stop_id: u16) -> Result<(), RuntimeError> {
        let mut pcr = pcr::parse_frag(&mut self.heap, accum, stop_id, Pcr::Start)?;
        while pcr != Pcr::Done {
            self.host_action(accum)?;
            if self.induce_exit {
                return Ok(());
            }
            pcr = pcr::parse_frag(&mut self.heap, accum, stop_id, pcr)?;
        }
        Ok(())
    }

    /// Drive a parse to the end of input. Returns a new reference to the result.
    pub fn parse_finish(&mut self, accum: TreeRef, revert: bool) -> Result<Option<TreeRef>, RuntimeError> {
        let mut pcr = pcr::parse_finish(&mut self.heap, accum, revert, Pcr::Start)?;
        while pcr != Pcr::Done {
            self.host_action(accum)?;
            if self.induce_exit {
                return Ok(None);
            }
            pcr = pcr::parse_finish(&mut self.heap, accum, revert, pcr)?;
        }
        let result = self.heap.with_accum(accum, |_, a| Ok(a.result))?;
        self.heap.upref_opt(result)?;
        Ok(result)
    }

    /// Back a parse up to `steps`, replaying reverse code as requested.
    pub fn undo_parse_frag(&mut self, accum: TreeRef, steps: u64) -> Result<(), RuntimeError> {
        let mut pcr = pcr::undo_parse_frag(&mut self.heap, accum, steps, Pcr::Start)?;
        while pcr != Pcr::Done {
            self.host_action(accum)?;
            if self.induce_exit {
                return Ok(());
            }
            pcr = pcr::undo_parse_frag(&mut self.heap, accum, steps, pcr)?;
        }
        Ok(())
    }

    fn host_action(&mut self, accum: TreeRef) -> Result<(), RuntimeError> {
        let depth = self.stack.len();
        self.run_action(accum)?;
        if self.induce_exit {
            self.unwind_to(depth)?;
        }
        Ok(())
    }

    /// Run a top-level execution. Leftovers of an induced exit are released.
    fn enter(&mut self, exec: Execution) -> Result<(), RuntimeError> {
        let depth = self.stack.len();
        self.run_nested(exec)?;
        if self.induce_exit {
            self.unwind_to(depth)?;
        }
        Ok(())
    }

    /// Run `exec` to completion, then restore the current execution.
    pub(crate) fn run_nested(&mut self, exec: Execution) -> Result<(), RuntimeError> {
        let saved = std::mem::replace(&mut self.exec, exec);
        let result = self.run_block();
        self.exec = saved;
        result
    }

    /// Run whatever action the accumulator's driver requested.
    pub(crate) fn run_action(&mut self, accum: TreeRef) -> Result<(), RuntimeError> {
        let action = self.heap.with_accum(accum, |_, a| Ok(std::mem::take(&mut a.run.action)))?;
        match action {
            Action::None => Ok(()),
            Action::Frame { frame_id } => {
                let revert = self.heap.with_accum(accum, |_, a| {
                    a.run.frame_id = frame_id;
                    Ok(a.run.revert_on)
                })?;
                debug!(target: "sprig::pcr", frame_id, revert, "reduction action");
                let exec = self.frame_execution(accum, frame_id, revert)?;
                self.run_nested(exec)
            }
            Action::Revert(group) => {
                debug!(target: "sprig::pcr", len = group.len(), "revert action");
                let exec = self.reverse_execution(accum, group);
                self.run_nested(exec)
            }
        }
    }

    fn frame_execution(&self, accum: TreeRef, frame_id: u16, revert: bool) -> Result<Execution, RuntimeError> {
        let frame = self.frame(frame_id)?;
        let ip = if revert { frame.code_wv } else { frame.code_wc };
        let mut exec = Execution::new(self.code.clone(), ip, self.stack.len());
        exec.accum = Some(accum);
        exec.frame_id = frame_id;
        Ok(exec)
    }

    fn reverse_execution(&self, accum: TreeRef, group: Vec<u8>) -> Execution {
        let mut exec = Execution::new(Rc::from(group), 0, self.stack.len());
        exec.accum = Some(accum);
        exec.reverse = true;
        exec
    }

    /// Pop and release everything above `depth`.
    pub(crate) fn unwind_to(&mut self, depth: usize) -> Result<(), RuntimeError> {
        while self.stack.len() > depth {
            let slot = self.pop()?;
            self.release(slot)?;
        }
        Ok(())
    }

    // ---- stack

    /// Push a slot, checking for overflow.
    pub(crate) fn push(&mut self, slot: Slot) -> Result<(), RuntimeError> {
        if self.stack.len() >= self.options.max_stack_depth {
            return Err(RuntimeError::StackOverflow { at: self.at });
        }
        self.stack.push(slot);
        Ok(())
    }

    pub(crate) fn push_tree(&mut self, tree: Option<TreeRef>) -> Result<(), RuntimeError> {
        self.push(Slot::from_tree(tree))
    }

    /// Push a new reference to `tree`.
    pub(crate) fn push_shared(&mut self, tree: Option<TreeRef>) -> Result<(), RuntimeError> {
        self.heap.upref_opt(tree)?;
        self.push_tree(tree)
    }

    pub(crate) fn push_bool(&mut self, value: bool) -> Result<(), RuntimeError> {
        let t = if value { self.true_val } else { self.false_val };
        self.push_shared(Some(t))
    }

    pub(crate) fn push_int(&mut self, value: i64) -> Result<(), RuntimeError> {
        let t = self.heap.int(value);
        self.push_tree(Some(t))
    }

    pub(crate) fn push_str(&mut self, text: impl Into<Vec<u8>>) -> Result<(), RuntimeError> {
        let t = self.heap.string(text);
        self.push_tree(Some(t))
    }

    pub(crate) fn pop(&mut self) -> Result<Slot, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow { at: self.at })
    }

    /// Pop a tree slot. The caller takes over its reference.
    pub(crate) fn pop_tree(&mut self) -> Result<Option<TreeRef>, RuntimeError> {
        match self.pop()? {
            Slot::Tree(t) => Ok(Some(t)),
            Slot::Nil => Ok(None),
            _ => Err(self.mismatch("tree")),
        }
    }

    /// Pop a tree that must not be nil.
    pub(crate) fn pop_some(&mut self) -> Result<TreeRef, RuntimeError> {
        self.pop_tree()?.ok_or_else(|| self.mismatch("non-nil tree"))
    }

    pub(crate) fn pop_word(&mut self) -> Result<u64, RuntimeError> {
        match self.pop()? {
            Slot::Word(w) => Ok(w),
            _ => Err(self.mismatch("word")),
        }
    }

    /// Pop an Int tree and release it.
    pub(crate) fn pop_int(&mut self) -> Result<i64, RuntimeError> {
        let t = self.pop_some()?;
        let value = self.heap.int_value(t)?;
        self.heap.downref(t)?;
        value.ok_or_else(|| self.mismatch("int"))
    }

    /// Pop a Str tree and release it.
    pub(crate) fn pop_str(&mut self) -> Result<Vec<u8>, RuntimeError> {
        let t = self.pop_some()?;
        let value = self.heap.str_value(t)?.map(|s| s.to_vec());
        self.heap.downref(t)?;
        value.ok_or_else(|| self.mismatch("str"))
    }

    /// Pop and release `n` slots.
    pub(crate) fn pop_n(&mut self, n: usize) -> Result<(), RuntimeError> {
        for _ in 0..n {
            let slot = self.pop()?;
            self.release(slot)?;
        }
        Ok(())
    }

    /// Drop whatever a slot owns.
    pub(crate) fn release(&mut self, slot: Slot) -> Result<(), RuntimeError> {
        if let Slot::Tree(t) = slot {
            self.heap.downref(t)?;
        }
        Ok(())
    }

    /// The tree held `depth` slots below the top, not owned.
    pub(crate) fn peek_tree(&self, depth: usize) -> Result<Option<TreeRef>, RuntimeError> {
        let slot = self
            .stack
            .len()
            .checked_sub(depth + 1)
            .and_then(|i| self.stack.get(i))
            .ok_or(RuntimeError::StackUnderflow { at: self.at })?;
        match slot {
            Slot::Tree(t) => Ok(Some(*t)),
            Slot::Nil => Ok(None),
            _ => Err(self.mismatch("tree")),
        }
    }

    /// Absolute stack index of a frame-relative local.
    pub(crate) fn local(&self, offset: i16) -> Result<usize, RuntimeError> {
        let idx = self.exec.frame_ptr as isize + offset as isize;
        if idx < 0 || idx as usize >= self.stack.len() {
            return Err(RuntimeError::invariant(
                self.at,
                format!("local {offset} outside the stack (frame at {})", self.exec.frame_ptr),
            ));
        }
        Ok(idx as usize)
    }

    /// Tree held by a local, not owned.
    pub(crate) fn local_tree(&self, offset: i16) -> Result<Option<TreeRef>, RuntimeError> {
        let idx = self.local(offset)?;
        match &self.stack[idx] {
            Slot::Tree(t) => Ok(Some(*t)),
            Slot::Nil => Ok(None),
            _ => Err(self.mismatch("tree local")),
        }
    }

    /// Store into a local, releasing what it held.
    pub(crate) fn set_local(&mut self, offset: i16, slot: Slot) -> Result<(), RuntimeError> {
        let idx = self.local(offset)?;
        let old = std::mem::replace(&mut self.stack[idx], slot);
        self.release(old)
    }

    /// Truthiness: nil and false are false.
    pub(crate) fn test(&self, tree: Option<TreeRef>) -> bool {
        let Some(t) = tree else { return false };
        if t == self.false_val {
            return false;
        }
        !matches!(self.heap.get(t), Ok(tr) if tr.id == ID_BOOL && matches!(tr.payload, Payload::Int(0)))
    }

    pub(crate) fn mismatch(&self, expected: &'static str) -> RuntimeError {
        RuntimeError::TypeMismatch { at: self.at, expected }
    }

    // ---- tables

    pub(crate) fn frame(&self, id: u16) -> Result<&'a FrameInfo, RuntimeError> {
        self.program
            .frame(id)
            .ok_or(RuntimeError::UnknownFrame { at: self.at, id })
    }

    pub(crate) fn function(&self, id: u16) -> Result<&'a FunctionInfo, RuntimeError> {
        self.program
            .function(id)
            .ok_or(RuntimeError::UnknownFunction { at: self.at, id })
    }

    /// The running accumulator, required by parse-only instructions.
    pub(crate) fn current_accum(&self) -> Result<TreeRef, RuntimeError> {
        self.exec
            .accum
            .ok_or_else(|| RuntimeError::invariant(self.at, "instruction needs a running parse"))
    }

    // ---- reverse-code logging

    fn with_collect<R>(
        &mut self,
        f: impl FnOnce(&mut RtCodeVect) -> Result<R, RuntimeError>,
    ) -> Result<R, RuntimeError> {
        let accum = self.current_accum()?;
        self.heap.with_accum(accum, |_, a| f(&mut a.run.rcode_collect))
    }

    /// Begin a unit with its first reverse instruction.
    pub(crate) fn rcode_start(&mut self, op: Opcode, args: &[u64]) -> Result<(), RuntimeError> {
        self.exec.unit_len = self.with_collect(|c| Ok(c.append(op, args)))?;
        Ok(())
    }

    /// Add a path instruction to the unit being built.
    pub(crate) fn rcode_extend(&mut self, op: Opcode, args: &[u64]) -> Result<(), RuntimeError> {
        self.exec.unit_len += self.with_collect(|c| Ok(c.append(op, args)))?;
        Ok(())
    }

    /// Add the mutating instruction and close the unit.
    pub(crate) fn rcode_finish(&mut self, op: Opcode, args: &[u64]) -> Result<(), RuntimeError> {
        let len = self.exec.unit_len;
        self.exec.unit_len = 0;
        self.with_collect(|c| {
            let total = len + c.append(op, args);
            c.append_unit_len(total)
        })
    }

    /// Append a complete unit.
    pub(crate) fn rcode_unit(&mut self, ops: &[(Opcode, &[u64])]) -> Result<(), RuntimeError> {
        self.exec.unit_len = 0;
        self.with_collect(|c| {
            let total = ops.iter().map(|(op, args)| c.append(*op, args)).sum();
            c.append_unit_len(total)
        })
    }
}

impl Drop for Vm<'_> {
    fn drop(&mut self) {
        // Errors cannot surface from drop; a broken heap is dropped whole.
        let _ = self.unwind_to(0);
        let _ = self.heap.downref(self.global);
        let _ = self.heap.downref(self.true_val);
        let _ = self.heap.downref(self.false_val);
        let _ = self.heap.downref_opt(self.stdin.take());
        let _ = self.heap.downref_opt(self.last_parse_error.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> Program {
        let mut p = Program::new(vec![Opcode::Stop as u8]);
        p.global_size = 2;
        p
    }

    #[test]
    fn push_respects_depth_limit() {
        let p = program();
        let mut vm = Vm::with_options(
            &p,
            VmOptions {
                max_stack_depth: 2,
                ..VmOptions::default()
            },
        );
        vm.push(Slot::Nil).unwrap();
        vm.push(Slot::Word(1)).unwrap();
        assert_eq!(vm.push(Slot::Nil), Err(RuntimeError::StackOverflow { at: 0 }));
    }

    #[test]
    fn pop_empty_underflows() {
        let p = program();
        let mut vm = Vm::new(&p);
        assert_eq!(vm.pop(), Err(RuntimeError::StackUnderflow { at: 0 }));
    }

    #[test]
    fn pop_int_releases_the_operand() {
        let p = program();
        let mut vm = Vm::new(&p);
        let base = vm.heap.live_count();
        vm.push_int(9).unwrap();
        assert_eq!(vm.pop_int().unwrap(), 9);
        assert_eq!(vm.heap.live_count(), base);
    }

    #[test]
    fn wrong_slot_kind_is_a_mismatch() {
        let p = program();
        let mut vm = Vm::new(&p);
        vm.push(Slot::Word(3)).unwrap();
        assert_eq!(
            vm.pop_tree(),
            Err(RuntimeError::TypeMismatch { at: 0, expected: "tree" })
        );
    }

    #[test]
    fn truthiness() {
        let p = program();
        let vm = Vm::new(&p);
        assert!(vm.test(Some(vm.true_val)));
        assert!(!vm.test(Some(vm.false_val)));
        assert!(!vm.test(None));
        assert_eq!(vm.heap.attr(vm.global, 1).unwrap(), None);
    }

    #[test]
    fn logging_needs_a_parse() {
        let p = program();
        let mut vm = Vm::new(&p);
        let err = vm.rcode_start(Opcode::LoadGlobalBkt, &[]).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn unit_helpers_close_units() {
        let p = program();
        let mut vm = Vm::new(&p);
        let accum = pcr::alloc_accum(&mut vm.heap, None, true);
        vm.exec.accum = Some(accum);
        vm.rcode_start(Opcode::LoadGlobalBkt, &[]).unwrap();
        vm.rcode_extend(Opcode::GetFieldBkt, &[0]).unwrap();
        vm.rcode_finish(Opcode::ListAppendBkt, &[]).unwrap();
        let bytes = vm
            .heap
            .with_accum(accum, |_, a| Ok(a.run.rcode_collect.as_bytes().to_vec()))
            .unwrap();
        assert_eq!(bytes.len(), 1 + 3 + 1 + 1);
        assert_eq!(*bytes.last().unwrap(), 5);
        vm.exec.accum = None;
        vm.heap.downref(accum).unwrap();
    }
}
