//! References, tree iterators and user iterators.
//!
//! A [`Ref`] names a storage location: a stack slot plus a path of attribute
//! and child steps into the tree the slot holds. Reads resolve it; writes
//! split every tree along the path first so shared trees are never mutated.
//!
//! A user iterator is a coroutine over the iterator body's code. Its state
//! lives in a [`UserIter`] slot on the caller's stack, directly below a
//! three-slot header that `UITER_ADVANCE` fills with the caller's return
//! point. The body's locals and temporaries sit above the header and stay
//! there while the iterator is suspended, so the caller must bring the
//! stack back to the recorded footprint before resuming or destroying it.

use sprig_common::{Instruction, LangElId};
use tracing::trace;

use crate::error::RuntimeError;
use crate::machine::{Slot, Vm};
use crate::tree::TreeRef;

/// One step of a reference path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Attr(u16),
    Child(usize),
}

/// A location on the stack or inside a tree held by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ref {
    /// Absolute stack index.
    pub base: usize,
    pub steps: Vec<Step>,
}

impl Ref {
    pub fn slot(base: usize) -> Self {
        Self {
            base,
            steps: Vec::new(),
        }
    }

    pub fn then(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }
}

/// Walks the descendants of the tree at `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeIter {
    pub root: Ref,
    pub search_id: LangElId,
    /// Child positions from the root down to the current node.
    pub path: Vec<usize>,
    started: bool,
    done: bool,
    /// Stack depth when the iterator was created.
    depth: usize,
}

impl TreeIter {
    fn new(root: Ref, search_id: LangElId, depth: usize) -> Self {
        Self {
            root,
            search_id,
            path: Vec::new(),
            started: false,
            done: false,
            depth,
        }
    }

    /// Location of the current node, if the walk is on one.
    pub fn current(&self) -> Option<Ref> {
        if !self.started || self.done {
            return None;
        }
        let mut r = self.root.clone();
        r.steps.extend(self.path.iter().map(|&i| Step::Child(i)));
        Some(r)
    }
}

/// Where a user iterator continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Not yet started; the body begins here.
    Entry(usize),
    /// Suspended at a `YIELD`; continue after it.
    Suspended(usize),
    /// The body yielded nil and will never run again.
    Finished,
}

/// State of a user iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIter {
    pub resume: Resume,
    /// Frame pointer of the suspended body.
    pub frame_ptr: usize,
    /// Stack index just above the iterator's header.
    pub stack_root: usize,
    pub arg_size: usize,
    /// Slots the body occupied above `stack_root` when it last suspended.
    pub footprint: usize,
    pub search_id: LangElId,
    /// Location of the last yielded value.
    pub cur: Option<Ref>,
    /// Frame the body runs in.
    pub frame_id: u16,
    caller_frame_id: u16,
}

/// Slots between the iterator slot and `stack_root`.
const UITER_HEADER: usize = 3;

impl Vm<'_> {
    // ---- references

    /// The tree at a location, not owned.
    pub(crate) fn resolve(&self, r: &Ref) -> Result<Option<TreeRef>, RuntimeError> {
        let mut cur = match self.stack.get(r.base) {
            Some(Slot::Tree(t)) => Some(*t),
            Some(Slot::Nil) => None,
            Some(Slot::Ref(inner)) => self.resolve(inner)?,
            Some(_) => return Err(self.mismatch("tree or ref")),
            None => return Err(RuntimeError::invariant(self.at, format!("ref to dead slot {}", r.base))),
        };
        for step in &r.steps {
            let Some(t) = cur else {
                return Ok(None);
            };
            cur = match *step {
                Step::Attr(f) => self.heap.attr(t, f as usize)?,
                Step::Child(i) => self.heap.child(t, i)?,
            };
        }
        Ok(cur)
    }

    /// Like [`Vm::resolve`], splitting every shared tree on the way so the
    /// result may be mutated.
    pub(crate) fn resolve_split(&mut self, r: &Ref) -> Result<Option<TreeRef>, RuntimeError> {
        let mut cur = match self.stack.get(r.base).cloned() {
            Some(Slot::Tree(t)) => {
                let unique = self.heap.split(t)?;
                self.stack[r.base] = Slot::Tree(unique);
                Some(unique)
            }
            Some(Slot::Nil) => None,
            Some(Slot::Ref(inner)) => self.resolve_split(&inner)?,
            Some(_) => return Err(self.mismatch("tree or ref")),
            None => return Err(RuntimeError::invariant(self.at, format!("ref to dead slot {}", r.base))),
        };
        for step in &r.steps {
            let Some(t) = cur else {
                return Ok(None);
            };
            cur = match *step {
                Step::Attr(f) => self.heap.split_attr(t, f as usize)?,
                Step::Child(i) => self.heap.split_child(t, i)?,
            };
        }
        Ok(cur)
    }

    /// Store `value` at a location, releasing what was there. The value's
    /// reference moves into the location.
    pub(crate) fn write_ref(&mut self, r: &Ref, value: Option<TreeRef>) -> Result<(), RuntimeError> {
        let Some((last, parent_steps)) = r.steps.split_last() else {
            return match self.stack.get(r.base).cloned() {
                Some(Slot::Ref(inner)) => self.write_ref(&inner, value),
                Some(Slot::Tree(_) | Slot::Nil) => {
                    let old = std::mem::replace(&mut self.stack[r.base], Slot::from_tree(value));
                    self.release(old)
                }
                _ => Err(self.mismatch("tree or ref")),
            };
        };
        let parent = Ref {
            base: r.base,
            steps: parent_steps.to_vec(),
        };
        let parent = self
            .resolve_split(&parent)?
            .ok_or_else(|| RuntimeError::invariant(self.at, "write through a nil reference"))?;
        let old = match *last {
            Step::Attr(f) => self.heap.set_attr(parent, f as usize, value)?,
            Step::Child(i) => {
                let value = value.ok_or_else(|| self.mismatch("non-nil child"))?;
                Some(self.heap.set_child(parent, i, value)?)
            }
        };
        self.heap.downref_opt(old)
    }

    fn local_ref(&self, offset: i16) -> Result<Ref, RuntimeError> {
        let idx = self.local(offset)?;
        match &self.stack[idx] {
            Slot::Ref(r) => Ok((**r).clone()),
            _ => Err(self.mismatch("ref local")),
        }
    }

    pub(crate) fn exec_ref_from_local(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let idx = self.local(instr.signed_half(0))?;
        self.push(Slot::Ref(Box::new(Ref::slot(idx))))
    }

    pub(crate) fn exec_ref_from_ref(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let r = self.local_ref(instr.signed_half(0))?;
        self.push(Slot::Ref(Box::new(r)))
    }

    /// A field of the object in a local, which may itself hold a ref.
    pub(crate) fn exec_ref_from_qual_ref(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let idx = self.local(instr.signed_half(0))?;
        let r = Ref::slot(idx).then(Step::Attr(instr.half(1)));
        self.push(Slot::Ref(Box::new(r)))
    }

    pub(crate) fn exec_get_local_ref(&mut self, instr: &Instruction, write: bool) -> Result<(), RuntimeError> {
        let r = self.local_ref(instr.signed_half(0))?;
        let tree = if write { self.resolve_split(&r)? } else { self.resolve(&r)? };
        self.push_shared(tree)
    }

    pub(crate) fn exec_set_local_ref(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let r = self.local_ref(instr.signed_half(0))?;
        let value = self.pop_tree()?;
        self.write_ref(&r, value)
    }

    // ---- tree iterators

    fn tree_iter(&self, offset: i16) -> Result<(usize, TreeIter), RuntimeError> {
        let idx = self.local(offset)?;
        match &self.stack[idx] {
            Slot::TreeIter(it) => Ok((idx, (**it).clone())),
            _ => Err(self.mismatch("tree iterator")),
        }
    }

    pub(crate) fn exec_triter_from_ref(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let root = match self.pop()? {
            Slot::Ref(r) => *r,
            _ => return Err(self.mismatch("ref")),
        };
        let iter = TreeIter::new(root, instr.half(1), self.stack.len());
        self.set_local(instr.signed_half(0), Slot::TreeIter(Box::new(iter)))
    }

    /// Move to the next node in pre-order, or to the next direct child.
    pub(crate) fn exec_triter_advance(&mut self, instr: &Instruction, children_only: bool) -> Result<(), RuntimeError> {
        let (idx, mut iter) = self.tree_iter(instr.signed_half(0))?;
        let root = self.resolve(&iter.root)?;
        let any = self.program.any_id;
        let mut found = false;
        if let Some(root) = root {
            while !iter.done {
                let moved = if children_only {
                    self.next_child(root, &mut iter)?
                } else {
                    self.next_preorder(root, &mut iter)?
                };
                if !moved {
                    iter.done = true;
                    break;
                }
                let node = self.walk(root, &iter.path)?;
                if iter.search_id == any || self.heap.get(node)?.id == iter.search_id {
                    found = true;
                    break;
                }
            }
        } else {
            iter.started = true;
            iter.done = true;
        }
        trace!(target: "sprig::vm", found, depth = iter.path.len(), "tree iterator advance");
        self.stack[idx] = Slot::TreeIter(Box::new(iter));
        self.push_bool(found)
    }

    fn walk(&self, root: TreeRef, path: &[usize]) -> Result<TreeRef, RuntimeError> {
        let mut t = root;
        for &i in path {
            t = self
                .heap
                .child(t, i)?
                .ok_or_else(|| RuntimeError::invariant(self.at, "tree changed under its iterator"))?;
        }
        Ok(t)
    }

    fn child_count(&self, t: TreeRef) -> Result<usize, RuntimeError> {
        Ok(self.heap.get(t)?.children.len())
    }

    fn next_preorder(&self, root: TreeRef, iter: &mut TreeIter) -> Result<bool, RuntimeError> {
        if !iter.started {
            iter.started = true;
            if self.child_count(root)? == 0 {
                return Ok(false);
            }
            iter.path.push(0);
            return Ok(true);
        }
        let cur = self.walk(root, &iter.path)?;
        if self.child_count(cur)? > 0 {
            iter.path.push(0);
            return Ok(true);
        }
        while let Some(i) = iter.path.pop() {
            let parent = self.walk(root, &iter.path)?;
            if i + 1 < self.child_count(parent)? {
                iter.path.push(i + 1);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn next_child(&self, root: TreeRef, iter: &mut TreeIter) -> Result<bool, RuntimeError> {
        let next = if iter.started {
            iter.path.first().map_or(0, |i| i + 1)
        } else {
            0
        };
        iter.started = true;
        if next < self.child_count(root)? {
            iter.path = vec![next];
            Ok(true)
        } else {
            iter.path.clear();
            Ok(false)
        }
    }

    pub(crate) fn exec_triter_get_cur(&mut self, instr: &Instruction, write: bool) -> Result<(), RuntimeError> {
        let (_, iter) = self.tree_iter(instr.signed_half(0))?;
        let tree = match iter.current() {
            Some(r) if write => self.resolve_split(&r)?,
            Some(r) => self.resolve(&r)?,
            None => None,
        };
        self.push_shared(tree)
    }

    pub(crate) fn exec_triter_set_cur(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let (_, iter) = self.tree_iter(instr.signed_half(0))?;
        let value = self.pop_tree()?;
        match iter.current() {
            Some(r) => self.write_ref(&r, value),
            None => {
                self.heap.downref_opt(value)?;
                Err(RuntimeError::invariant(self.at, "set through an idle tree iterator"))
            }
        }
    }

    pub(crate) fn exec_triter_ref_from_cur(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let (_, iter) = self.tree_iter(instr.signed_half(0))?;
        match iter.current() {
            Some(r) => self.push(Slot::Ref(Box::new(r))),
            None => self.push(Slot::Nil),
        }
    }

    pub(crate) fn exec_triter_destroy(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let (idx, iter) = self.tree_iter(instr.signed_half(0))?;
        if iter.depth != self.stack.len() {
            return Err(RuntimeError::IteratorFootprint {
                at: self.at,
                expected: iter.depth,
                found: self.stack.len(),
            });
        }
        self.stack[idx] = Slot::Nil;
        Ok(())
    }

    // ---- user iterators

    fn user_iter(&self, idx: usize) -> Result<&UserIter, RuntimeError> {
        match self.stack.get(idx) {
            Some(Slot::UserIter(u)) => Ok(u),
            _ => Err(self.mismatch("user iterator")),
        }
    }

    fn user_iter_mut(&mut self, idx: usize) -> Result<&mut UserIter, RuntimeError> {
        let at = self.at;
        match self.stack.get_mut(idx) {
            Some(Slot::UserIter(u)) => Ok(u),
            _ => Err(RuntimeError::TypeMismatch {
                at,
                expected: "user iterator",
            }),
        }
    }

    /// The stack must stand exactly where the body left it.
    fn check_footprint(&self, uiter: &UserIter) -> Result<(), RuntimeError> {
        let found = self.stack.len().checked_sub(uiter.stack_root);
        if found != Some(uiter.footprint) {
            return Err(RuntimeError::IteratorFootprint {
                at: self.at,
                expected: uiter.footprint,
                found: found.unwrap_or(0),
            });
        }
        Ok(())
    }

    /// Push the iterator slot and its header. The arguments are already on
    /// the stack.
    pub(crate) fn exec_uiter_create(&mut self, instr: &Instruction, revert: bool) -> Result<(), RuntimeError> {
        let arg_size = instr.half(0) as usize;
        let func = self.function(instr.half(1))?;
        let frame = self.frame(func.frame_id)?;
        let entry = if revert { frame.code_wv } else { frame.code_wc };
        if self.stack.len() < arg_size {
            return Err(RuntimeError::StackUnderflow { at: self.at });
        }
        let uiter = UserIter {
            resume: Resume::Entry(entry),
            frame_ptr: 0,
            stack_root: self.stack.len() + 1 + UITER_HEADER,
            arg_size,
            footprint: 0,
            search_id: instr.half(2),
            cur: None,
            frame_id: func.frame_id,
            caller_frame_id: 0,
        };
        trace!(target: "sprig::vm", func = %func.name, arg_size, "create user iterator");
        self.push(Slot::UserIter(Box::new(uiter)))?;
        self.push(Slot::Ip(0))?;
        self.push(Slot::Word(0))?;
        self.push(Slot::Word(0))
    }

    pub(crate) fn exec_uiter_advance(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let idx = self.local(instr.signed_half(0))?;
        let uiter = self.user_iter(idx)?.clone();
        self.check_footprint(&uiter)?;
        let ip = match uiter.resume {
            Resume::Finished => return self.push_bool(false),
            Resume::Entry(ip) | Resume::Suspended(ip) => ip,
        };
        let root = uiter.stack_root;
        self.stack[root - 3] = Slot::Ip(self.exec.ip);
        self.stack[root - 2] = Slot::Word(self.exec.iframe_ptr as u64);
        self.stack[root - 1] = Slot::Word(self.exec.frame_ptr as u64);
        let caller_frame_id = self.exec.frame_id;
        self.user_iter_mut(idx)?.caller_frame_id = caller_frame_id;

        self.exec.ip = ip;
        self.exec.iframe_ptr = root;
        self.exec.frame_ptr = uiter.frame_ptr;
        self.exec.frame_id = uiter.frame_id;
        Ok(())
    }

    /// Suspend the running iterator body, handing a location to the caller.
    /// A location whose tree does not match the search id is skipped.
    pub(crate) fn exec_yield(&mut self) -> Result<(), RuntimeError> {
        let yielded = match self.pop()? {
            Slot::Ref(r) => Some(*r),
            Slot::Nil => None,
            _ => return Err(self.mismatch("ref or nil")),
        };
        let root = self.exec.iframe_ptr;
        let idx = root
            .checked_sub(1 + UITER_HEADER)
            .ok_or_else(|| RuntimeError::invariant(self.at, "YIELD outside an iterator"))?;
        let search_id = self.user_iter(idx)?.search_id;

        if let Some(r) = &yielded {
            let tree = self.resolve(r)?;
            let matches = match tree {
                Some(t) => search_id == self.program.any_id || self.heap.get(t)?.id == search_id,
                None => false,
            };
            if !matches {
                return Ok(());
            }
        }

        let found = yielded.is_some();
        let resume_ip = self.exec.ip;
        let frame_ptr = self.exec.frame_ptr;
        let footprint = self.stack.len() - root;
        let uiter = self.user_iter_mut(idx)?;
        uiter.resume = if found {
            Resume::Suspended(resume_ip)
        } else {
            Resume::Finished
        };
        uiter.cur = yielded;
        uiter.frame_ptr = frame_ptr;
        uiter.footprint = footprint;
        let caller_frame_id = uiter.caller_frame_id;

        self.exec.ip = match &self.stack[root - 3] {
            Slot::Ip(ip) => *ip,
            _ => return Err(self.mismatch("saved ip")),
        };
        self.exec.iframe_ptr = self.header_word(root - 2)?;
        self.exec.frame_ptr = self.header_word(root - 1)?;
        self.exec.frame_id = caller_frame_id;
        trace!(target: "sprig::vm", found, footprint, "yield");
        self.push_bool(found)
    }

    fn header_word(&self, idx: usize) -> Result<usize, RuntimeError> {
        match &self.stack[idx] {
            Slot::Word(w) => Ok(*w as usize),
            _ => Err(self.mismatch("saved word")),
        }
    }

    pub(crate) fn exec_uiter_get_cur(&mut self, instr: &Instruction, write: bool) -> Result<(), RuntimeError> {
        let idx = self.local(instr.signed_half(0))?;
        let cur = self.user_iter(idx)?.cur.clone();
        let tree = match cur {
            Some(r) if write => self.resolve_split(&r)?,
            Some(r) => self.resolve(&r)?,
            None => None,
        };
        self.push_shared(tree)
    }

    pub(crate) fn exec_uiter_set_cur(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let idx = self.local(instr.signed_half(0))?;
        let cur = self.user_iter(idx)?.cur.clone();
        let value = self.pop_tree()?;
        match cur {
            Some(r) => self.write_ref(&r, value),
            None => {
                self.heap.downref_opt(value)?;
                Err(RuntimeError::invariant(self.at, "set through an idle user iterator"))
            }
        }
    }

    pub(crate) fn exec_uiter_ref_from_cur(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let idx = self.local(instr.signed_half(0))?;
        match self.user_iter(idx)?.cur.clone() {
            Some(r) => self.push(Slot::Ref(Box::new(r))),
            None => self.push(Slot::Nil),
        }
    }

    /// Release the body's window, the header, the iterator and its arguments.
    pub(crate) fn exec_uiter_destroy(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let idx = self.local(instr.signed_half(0))?;
        let uiter = self.user_iter(idx)?.clone();
        self.check_footprint(&uiter)?;
        let bottom = idx
            .checked_sub(uiter.arg_size)
            .ok_or_else(|| RuntimeError::invariant(self.at, "iterator arguments below the stack"))?;
        trace!(target: "sprig::vm", depth = bottom, "destroy user iterator");
        self.unwind_to(bottom)
    }
}
