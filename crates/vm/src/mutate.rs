//! Mutating instruction families: fields, pointers, token data, lists,
//! maps and streams, plus tree construction.
//!
//! The object operand of a mutating instruction was loaded through a path
//! that already split it, so it is written in place. Its stack reference is
//! dropped only after the write. `_WV` handlers close the reverse unit their
//! path opened, and each `_BKT` handler takes over the references its
//! operands carry.

use sprig_common::lang_el::ID_STR;
use sprig_common::{Instruction, Opcode};
use tracing::trace;

use crate::error::RuntimeError;
use crate::machine::{Slot, Vm};
use crate::pcr;
use crate::tree::{Head, Payload, Tree, TreeFlags, TreeRef};

/// `STREAM_PUSH_BKT` operand for a pushed tree.
const PUSHED_TREE: u64 = u64::MAX;

impl Vm<'_> {
    // ---- fields

    pub(crate) fn exec_get_field_r(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let value = self.heap.attr(obj, instr.half(0) as usize)?;
        self.heap.upref_opt(value)?;
        self.heap.downref(obj)?;
        self.push_tree(value)
    }

    /// Also the replay of `GET_FIELD_BKT`.
    pub(crate) fn exec_get_field_wc(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let value = self.heap.split_attr(obj, instr.half(0) as usize)?;
        self.heap.upref_opt(value)?;
        self.heap.downref(obj)?;
        self.push_tree(value)
    }

    pub(crate) fn exec_set_field(&mut self, instr: &Instruction, undo: bool) -> Result<(), RuntimeError> {
        let field = instr.half(0);
        let obj = self.pop_some()?;
        let value = self.pop_tree()?;
        let prev = self.heap.set_attr(obj, field as usize, value)?;
        self.heap.downref(obj)?;
        if undo {
            self.rcode_finish(Opcode::SetFieldBkt, &[field as u64, TreeRef::to_word(prev)])
        } else {
            self.heap.downref_opt(prev)
        }
    }

    pub(crate) fn exec_set_field_bkt(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let prev = TreeRef::from_word(instr.word(1));
        let undone = self.heap.set_attr(obj, instr.half(0) as usize, prev)?;
        self.heap.downref_opt(undone)?;
        self.heap.downref(obj)
    }

    pub(crate) fn exec_set_field_leave(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let value = self.pop_tree()?;
        self.heap.upref_opt(value)?;
        let prev = self.heap.set_attr(obj, instr.half(0) as usize, value)?;
        self.heap.downref_opt(prev)?;
        self.heap.downref(obj)?;
        self.push_tree(value)
    }

    // ---- pointers

    fn pointee(&self, ptr: TreeRef) -> Result<Option<TreeRef>, RuntimeError> {
        match &self.heap.get(ptr)?.payload {
            Payload::Pointer(target) => Ok(*target),
            _ => Err(self.mismatch("pointer")),
        }
    }

    /// Make the pointer's target unique, rewriting the pointer if it had to
    /// be copied.
    fn split_pointee(&mut self, ptr: TreeRef) -> Result<Option<TreeRef>, RuntimeError> {
        let Some(target) = self.pointee(ptr)? else {
            return Ok(None);
        };
        let unique = self.heap.split(target)?;
        if unique != target {
            if let Payload::Pointer(slot) = &mut self.heap.get_mut(ptr)?.payload {
                *slot = Some(unique);
            }
        }
        Ok(Some(unique))
    }

    pub(crate) fn exec_ptr_deref_r(&mut self) -> Result<(), RuntimeError> {
        let ptr = self.pop_some()?;
        let target = self.pointee(ptr)?;
        self.heap.upref_opt(target)?;
        self.heap.downref(ptr)?;
        self.push_tree(target)
    }

    pub(crate) fn exec_ptr_deref_wc(&mut self) -> Result<(), RuntimeError> {
        let ptr = self.pop_some()?;
        let target = self.split_pointee(ptr)?;
        self.heap.upref_opt(target)?;
        self.heap.downref(ptr)?;
        self.push_tree(target)
    }

    /// Starts a unit. The log keeps the popped pointer reference.
    pub(crate) fn exec_ptr_deref_wv(&mut self) -> Result<(), RuntimeError> {
        let ptr = self.pop_some()?;
        let target = self.split_pointee(ptr)?;
        self.heap.upref_opt(target)?;
        self.push_tree(target)?;
        self.rcode_start(Opcode::PtrDerefBkt, &[TreeRef::to_word(Some(ptr))])
    }

    pub(crate) fn exec_ptr_deref_bkt(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let ptr = TreeRef::from_word(instr.word(0))
            .ok_or_else(|| RuntimeError::invariant(self.at, "reverse deref of a nil pointer"))?;
        let target = self.split_pointee(ptr)?;
        self.heap.upref_opt(target)?;
        self.heap.downref(ptr)?;
        self.push_tree(target)
    }

    // ---- token data

    pub(crate) fn exec_get_token_data(&mut self) -> Result<(), RuntimeError> {
        let tree = self.pop_some()?;
        let t = self.heap.get(tree)?;
        let text = match (&t.tokdata, &t.payload) {
            (Some(head), _) | (None, Payload::Str(head)) => Some(head.data.clone()),
            _ => None,
        };
        self.heap.downref(tree)?;
        match text {
            Some(text) => self.push_str(text),
            None => self.push(Slot::Nil),
        }
    }

    /// Replace a tree's token text. The undo form captures the previous head,
    /// location included, in a Str tree owned by the log.
    pub(crate) fn exec_set_token_data(&mut self, undo: bool) -> Result<(), RuntimeError> {
        let tree = self.pop_some()?;
        let value = self.pop_tree()?;
        let text = self.heap.text(value)?;
        self.heap.downref_opt(value)?;
        let prev = self.heap.get_mut(tree)?.tokdata.replace(Head::new(text));
        self.heap.downref(tree)?;
        if undo {
            let saved = prev.map(|head| self.heap.alloc(Tree::new(ID_STR, Payload::Str(head))));
            self.rcode_finish(Opcode::SetTokenDataBkt, &[TreeRef::to_word(saved)])
        } else {
            Ok(())
        }
    }

    pub(crate) fn exec_set_token_data_bkt(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let tree = self.pop_some()?;
        let saved = TreeRef::from_word(instr.word(0));
        let prev = match saved {
            Some(s) => match &self.heap.get(s)?.payload {
                Payload::Str(head) => Some(head.clone()),
                _ => return Err(self.mismatch("saved token text")),
            },
            None => None,
        };
        self.heap.get_mut(tree)?.tokdata = prev;
        self.heap.downref_opt(saved)?;
        self.heap.downref(tree)
    }

    pub(crate) fn exec_get_token_pos(&mut self) -> Result<(), RuntimeError> {
        let tree = self.pop_some()?;
        let pos = self
            .heap
            .get(tree)?
            .tokdata
            .as_ref()
            .and_then(|h| h.location)
            .map(|loc| loc.byte as i64);
        self.heap.downref(tree)?;
        match pos {
            Some(byte) => self.push_int(byte),
            None => self.push(Slot::Nil),
        }
    }

    /// Length or text of the token the running parse is matching.
    pub(crate) fn exec_get_match(&mut self, length: bool) -> Result<(), RuntimeError> {
        let accum = self.current_accum()?;
        let text = self
            .heap
            .with_accum(accum, |_, a| Ok(a.run.tokdata.as_ref().map(|h| h.data.clone())))?
            .unwrap_or_default();
        if length {
            self.push_int(text.len() as i64)
        } else {
            self.push_str(text)
        }
    }

    // ---- construction

    /// A token of the given id holding the text being matched, if any.
    pub(crate) fn exec_construct_term(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let head = match self.exec.accum {
            Some(accum) => self.heap.with_accum(accum, |_, a| Ok(a.run.tokdata.clone()))?,
            None => None,
        };
        let mut tree = Tree::new(instr.half(0), Payload::Node);
        tree.tokdata = head;
        let t = self.heap.alloc(tree);
        self.push_tree(Some(t))
    }

    /// Pop `n` operands, returned in the order they were pushed.
    fn pop_operands(&mut self, n: usize) -> Result<Vec<Option<TreeRef>>, RuntimeError> {
        let mut items = Vec::with_capacity(n);
        for _ in 0..n {
            items.push(self.pop_tree()?);
        }
        items.reverse();
        Ok(items)
    }

    fn lang_el_id(&mut self, t: Option<TreeRef>) -> Result<u16, RuntimeError> {
        let id = match t {
            Some(t) => self.heap.int_value(t)?,
            None => None,
        };
        self.heap.downref_opt(t)?;
        id.and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| self.mismatch("language element id"))
    }

    pub(crate) fn exec_make_token(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let n = instr.byte(0) as usize;
        if n < 2 {
            return Err(RuntimeError::invariant(self.at, "MAKE_TOKEN needs an id and text"));
        }
        let mut items = self.pop_operands(n)?.into_iter();
        let id = self.lang_el_id(items.next().flatten())?;
        let text_tree = items.next().flatten();
        let text = self.heap.text(text_tree)?;
        self.heap.downref_opt(text_tree)?;

        let mut tree = Tree::token(id, text);
        tree.flags.insert(TreeFlags::ARTIFICIAL);
        tree.attrs = items.collect();
        let t = self.heap.alloc(tree);
        self.push_tree(Some(t))
    }

    pub(crate) fn exec_make_tree(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let n = instr.byte(0) as usize;
        if n < 1 {
            return Err(RuntimeError::invariant(self.at, "MAKE_TREE needs an id"));
        }
        let mut items = self.pop_operands(n)?.into_iter();
        let id = self.lang_el_id(items.next().flatten())?;
        let mut tree = Tree::new(id, Payload::Node);
        tree.flags.insert(TreeFlags::ARTIFICIAL);
        tree.children = items.flatten().collect();
        let t = self.heap.alloc(tree);
        self.push_tree(Some(t))
    }

    pub(crate) fn exec_cons_parser(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let id = instr.half(0);
        let driver = match self.parsers.get(&id) {
            Some(factory) => factory(),
            None => return Err(RuntimeError::UnknownParser { at: self.at, id }),
        };
        trace!(target: "sprig::pcr", id, "construct parser");
        let accum = pcr::alloc_accum(&mut self.heap, Some(driver), true);
        self.push_tree(Some(accum))
    }

    /// Depth-first search of a tree and its descendants for an id.
    pub(crate) fn exec_tree_search(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let id = instr.word(0);
        let root = self.pop_tree()?;
        let mut todo: Vec<TreeRef> = root.into_iter().collect();
        let mut found = None;
        while let Some(t) = todo.pop() {
            let tree = self.heap.get(t)?;
            if tree.id as u64 == id {
                found = Some(t);
                break;
            }
            todo.extend(tree.children.iter().rev());
        }
        self.heap.upref_opt(found)?;
        self.heap.downref_opt(root)?;
        self.push_tree(found)
    }

    // ---- lists

    fn list_mut(&mut self, obj: TreeRef) -> Result<&mut Vec<TreeRef>, RuntimeError> {
        let at = self.at;
        self.heap.list_items_mut(obj)?.ok_or(RuntimeError::TypeMismatch { at, expected: "list" })
    }

    /// Member 0 is the head, member 1 the tail.
    fn list_member(&self, obj: TreeRef, field: u16) -> Result<Option<usize>, RuntimeError> {
        let len = self
            .heap
            .list_items(obj)?
            .ok_or_else(|| self.mismatch("list"))?
            .len();
        match field {
            _ if len == 0 => Ok(None),
            0 => Ok(Some(0)),
            1 => Ok(Some(len - 1)),
            _ => Err(RuntimeError::invariant(self.at, format!("no list member {field}"))),
        }
    }

    pub(crate) fn exec_list_length(&mut self) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let len = self.list_mut(obj)?.len();
        self.heap.downref(obj)?;
        self.push_int(len as i64)
    }

    pub(crate) fn exec_list_append(&mut self, undo: bool) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let value = self.pop_some()?;
        self.list_mut(obj)?.push(value);
        self.heap.downref(obj)?;
        self.push_bool(true)?;
        if undo {
            self.rcode_finish(Opcode::ListAppendBkt, &[])?;
        }
        Ok(())
    }

    pub(crate) fn exec_list_append_bkt(&mut self) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let removed = self.list_mut(obj)?.pop();
        self.heap.downref_opt(removed)?;
        self.heap.downref(obj)
    }

    pub(crate) fn exec_list_remove_end(&mut self, undo: bool) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let removed = self.list_mut(obj)?.pop();
        self.heap.downref(obj)?;
        self.push_tree(removed)?;
        if undo {
            self.heap.upref_opt(removed)?;
            self.rcode_finish(Opcode::ListRemoveEndBkt, &[TreeRef::to_word(removed)])?;
        }
        Ok(())
    }

    pub(crate) fn exec_list_remove_end_bkt(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        if let Some(value) = TreeRef::from_word(instr.word(0)) {
            self.list_mut(obj)?.push(value);
        }
        self.heap.downref(obj)
    }

    pub(crate) fn exec_get_list_mem_r(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let value = match self.list_member(obj, instr.half(0))? {
            Some(i) => Some(self.list_mut(obj)?[i]),
            None => None,
        };
        self.heap.upref_opt(value)?;
        self.heap.downref(obj)?;
        self.push_tree(value)
    }

    /// Also the replay of `GET_LIST_MEM_BKT`.
    pub(crate) fn exec_get_list_mem_wc(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let value = match self.list_member(obj, instr.half(0))? {
            Some(i) => {
                let member = self.list_mut(obj)?[i];
                let unique = self.heap.split(member)?;
                self.list_mut(obj)?[i] = unique;
                Some(unique)
            }
            None => None,
        };
        self.heap.upref_opt(value)?;
        self.heap.downref(obj)?;
        self.push_tree(value)
    }

    fn replace_list_member(&mut self, obj: TreeRef, field: u16, value: TreeRef) -> Result<TreeRef, RuntimeError> {
        match self.list_member(obj, field)? {
            Some(i) => Ok(std::mem::replace(&mut self.list_mut(obj)?[i], value)),
            None => {
                self.heap.downref(value)?;
                Err(RuntimeError::invariant(self.at, "set member of an empty list"))
            }
        }
    }

    pub(crate) fn exec_set_list_mem(&mut self, instr: &Instruction, undo: bool) -> Result<(), RuntimeError> {
        let field = instr.half(0);
        let obj = self.pop_some()?;
        let value = self.pop_some()?;
        let prev = self.replace_list_member(obj, field, value)?;
        self.heap.downref(obj)?;
        if undo {
            self.rcode_finish(Opcode::SetListMemBkt, &[field as u64, TreeRef::to_word(Some(prev))])
        } else {
            self.heap.downref(prev)
        }
    }

    pub(crate) fn exec_set_list_mem_bkt(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let prev = TreeRef::from_word(instr.word(1))
            .ok_or_else(|| RuntimeError::invariant(self.at, "nil list member in reverse code"))?;
        let undone = self.replace_list_member(obj, instr.half(0), prev)?;
        self.heap.downref(undone)?;
        self.heap.downref(obj)
    }

    // ---- maps

    pub(crate) fn exec_map_length(&mut self) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let len = self.heap.with_map(obj, |_, map| Ok(map.len()))?;
        self.heap.downref(obj)?;
        self.push_int(len as i64)
    }

    pub(crate) fn exec_map_find(&mut self) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let key = self.pop_some()?;
        let value = self.heap.with_map(obj, |heap, map| {
            Ok(map.find(&key, |a, b| heap.cmp_tree(Some(*a), Some(*b))).copied())
        })?;
        self.heap.upref_opt(value)?;
        self.heap.downref(key)?;
        self.heap.downref(obj)?;
        self.push_tree(value)
    }

    /// Pushes whether the key was new. The undo unit owns a key reference
    /// either way.
    pub(crate) fn exec_map_insert(&mut self, undo: bool) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let value = self.pop_some()?;
        let key = self.pop_some()?;
        let rejected = self.heap.with_map(obj, |heap, map| {
            Ok(map.insert(key, value, |a, b| heap.cmp_tree(Some(*a), Some(*b))).err())
        })?;
        let inserted = rejected.is_none();
        self.heap.downref(obj)?;
        self.push_bool(inserted)?;
        if undo {
            self.heap.upref(key)?;
            self.rcode_finish(Opcode::MapInsertBkt, &[inserted as u64, TreeRef::to_word(Some(key))])?;
        }
        if let Some((key, value)) = rejected {
            self.heap.downref(key)?;
            self.heap.downref(value)?;
        }
        Ok(())
    }

    pub(crate) fn exec_map_insert_bkt(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let key = TreeRef::from_word(instr.word(1))
            .ok_or_else(|| RuntimeError::invariant(self.at, "nil map key in reverse code"))?;
        if instr.byte(0) != 0 {
            let removed = self.heap.with_map(obj, |heap, map| {
                Ok(map.uninsert(&key, |a, b| heap.cmp_tree(Some(*a), Some(*b))))
            })?;
            if let Some((k, v)) = removed {
                self.heap.downref(k)?;
                self.heap.downref(v)?;
            }
        }
        self.heap.downref(key)?;
        self.heap.downref(obj)
    }

    /// Pushes whether the key was new. A replaced binding keeps the map's
    /// own key.
    pub(crate) fn exec_map_store(&mut self, undo: bool) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let value = self.pop_some()?;
        let key = self.pop_some()?;
        let replaced = self.heap.with_map(obj, |heap, map| {
            Ok(map.store(key, value, |a, b| heap.cmp_tree(Some(*a), Some(*b))))
        })?;
        self.heap.downref(obj)?;
        self.push_bool(replaced.is_none())?;
        match (replaced, undo) {
            (None, false) => Ok(()),
            (None, true) => {
                self.heap.upref(key)?;
                self.rcode_finish(Opcode::MapStoreBkt, &[TreeRef::to_word(Some(key)), 0])
            }
            (Some((key, prev)), false) => {
                self.heap.downref(key)?;
                self.heap.downref(prev)
            }
            (Some((key, prev)), true) => self.rcode_finish(
                Opcode::MapStoreBkt,
                &[TreeRef::to_word(Some(key)), TreeRef::to_word(Some(prev))],
            ),
        }
    }

    pub(crate) fn exec_map_store_bkt(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let key = TreeRef::from_word(instr.word(0))
            .ok_or_else(|| RuntimeError::invariant(self.at, "nil map key in reverse code"))?;
        let prev = TreeRef::from_word(instr.word(1));
        let (k, v) = self.heap.with_map(obj, |heap, map| {
            Ok(map.unstore(&key, prev, |a, b| heap.cmp_tree(Some(*a), Some(*b))))
        })?;
        self.heap.downref_opt(k)?;
        self.heap.downref_opt(v)?;
        self.heap.downref(key)?;
        self.heap.downref(obj)
    }

    /// Pushes the removed value. The undo unit owns the removed pair.
    pub(crate) fn exec_map_remove(&mut self, undo: bool) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let key = self.pop_some()?;
        let removed = self.heap.with_map(obj, |heap, map| {
            Ok(map.remove(&key, |a, b| heap.cmp_tree(Some(*a), Some(*b))))
        })?;
        self.heap.downref(key)?;
        self.heap.downref(obj)?;
        let (k, v) = removed.unzip();
        if undo {
            self.push_shared(v)?;
            self.rcode_finish(Opcode::MapRemoveBkt, &[TreeRef::to_word(k), TreeRef::to_word(v)])
        } else {
            self.heap.downref_opt(k)?;
            self.push_tree(v)
        }
    }

    pub(crate) fn exec_map_remove_bkt(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let obj = self.pop_some()?;
        let key = TreeRef::from_word(instr.word(0));
        let value = TreeRef::from_word(instr.word(1));
        if let (Some(key), Some(value)) = (key, value) {
            let clash = self.heap.with_map(obj, |heap, map| {
                Ok(map.unremove(key, value, |a, b| heap.cmp_tree(Some(*a), Some(*b))).err())
            })?;
            if clash.is_some() {
                self.heap.downref(key)?;
                self.heap.downref(value)?;
                return Err(RuntimeError::invariant(self.at, "removed key reappeared before undo"));
            }
        }
        self.heap.downref(obj)
    }

    // ---- streams and accumulators

    /// The stream tree behind a stream or accumulator, not owned.
    fn stream_of(&mut self, t: TreeRef) -> Result<TreeRef, RuntimeError> {
        if self.heap.is_stream(t)? {
            return Ok(t);
        }
        if self.heap.is_accum(t)? {
            return self.heap.with_accum(t, |_, a| Ok(a.stream));
        }
        Err(self.mismatch("stream or accumulator"))
    }

    pub(crate) fn exec_get_accum_stream(&mut self) -> Result<(), RuntimeError> {
        let accum = self.pop_some()?;
        let stream = self.stream_of(accum)?;
        self.heap.upref(stream)?;
        self.heap.downref(accum)?;
        self.push_tree(Some(stream))
    }

    pub(crate) fn exec_get_accum_ctx(&mut self) -> Result<(), RuntimeError> {
        let accum = self.pop_some()?;
        let context = self.heap.with_accum(accum, |_, a| Ok(a.run.context))?;
        self.heap.upref_opt(context)?;
        self.heap.downref(accum)?;
        self.push_tree(context)
    }

    pub(crate) fn exec_set_accum_ctx(&mut self) -> Result<(), RuntimeError> {
        let accum = self.pop_some()?;
        let value = self.pop_tree()?;
        let prev = self
            .heap
            .with_accum(accum, |_, a| Ok(std::mem::replace(&mut a.run.context, value)))?;
        self.heap.downref_opt(prev)?;
        self.heap.downref(accum)
    }

    /// Append text, a nested stream or a token tree to a stream. The undo
    /// unit is self-contained and owns both operands.
    pub(crate) fn exec_stream_append(&mut self, undo: bool) -> Result<(), RuntimeError> {
        let target = self.pop_some()?;
        let input = self.pop_tree()?;
        let stream = self.stream_of(target)?;

        let mut len = 0;
        if let Some(input) = input {
            let text = self.heap.str_value(input)?.map(|s| s.to_vec());
            let nested = self.heap.is_stream(input)?;
            match text {
                Some(text) => {
                    len = text.len();
                    self.heap.with_stream(stream, |_, s| {
                        s.append_data(&text);
                        Ok(())
                    })?;
                }
                None => {
                    // The queue holds its own reference.
                    self.heap.upref(input)?;
                    self.heap.with_stream(stream, |_, s| {
                        if nested {
                            s.append_stream(input);
                        } else {
                            s.append_tree(input);
                        }
                        Ok(())
                    })?;
                }
            }
        }

        if undo {
            self.rcode_unit(&[(
                Opcode::StreamAppendBkt,
                &[TreeRef::to_word(Some(target)), TreeRef::to_word(input), len as u64],
            )])
        } else {
            self.heap.downref_opt(input)?;
            self.heap.downref(target)
        }
    }

    pub(crate) fn exec_stream_append_bkt(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let target = TreeRef::from_word(instr.word(0))
            .ok_or_else(|| RuntimeError::invariant(self.at, "nil stream in reverse code"))?;
        let input = TreeRef::from_word(instr.word(1));
        let len = instr.word(2) as usize;
        let stream = self.stream_of(target)?;
        if let Some(input) = input {
            let is_text = self.heap.str_value(input)?.is_some();
            if !is_text || len > 0 {
                let detached = self.heap.with_stream(stream, |_, s| {
                    Ok(if is_text {
                        s.undo_append_data(len)
                    } else {
                        s.undo_append_stream()
                    })
                })?;
                self.heap.downref_opt(detached)?;
            }
        }
        self.heap.downref_opt(input)?;
        self.heap.downref(target)
    }

    /// Pull and consume up to `len` bytes, pushing them as a Str.
    pub(crate) fn exec_stream_pull(&mut self, undo: bool) -> Result<(), RuntimeError> {
        let target = self.pop_some()?;
        let len = self.pop_int()?;
        let stream = self.stream_of(target)?;
        let len = usize::try_from(len).map_err(|_| self.mismatch("non-negative length"))?;
        let text = self.heap.with_stream(stream, |heap, s| {
            let text = s.pull(heap, len)?;
            s.consume_data(heap, text.len())?;
            Ok(text)
        })?;
        self.heap.downref(target)?;
        let pulled = self.heap.string(text);
        self.push_tree(Some(pulled))?;
        if undo {
            self.heap.upref(pulled)?;
            self.rcode_finish(Opcode::StreamPullBkt, &[TreeRef::to_word(Some(pulled))])?;
        }
        Ok(())
    }

    pub(crate) fn exec_stream_pull_bkt(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let target = self.pop_some()?;
        let pulled = TreeRef::from_word(instr.word(0));
        let stream = self.stream_of(target)?;
        let text = match pulled {
            Some(p) => self.heap.str_value(p)?.map(|s| s.to_vec()).unwrap_or_default(),
            None => Vec::new(),
        };
        if !text.is_empty() {
            self.heap.with_stream(stream, |heap, s| s.undo_consume_data(heap, &text))?;
        }
        self.heap.downref_opt(pulled)?;
        self.heap.downref(target)
    }

    /// Push text or a tree back in front of a stream. Pushes nil.
    pub(crate) fn exec_stream_push(&mut self, ignore: bool, undo: bool) -> Result<(), RuntimeError> {
        let target = self.pop_some()?;
        let input = self.pop_tree()?;
        let stream = self.stream_of(target)?;

        let mut pushed = 0;
        if let Some(input) = input {
            match self.heap.str_value(input)?.map(|s| s.to_vec()) {
                Some(text) => {
                    pushed = text.len() as u64;
                    if !text.is_empty() {
                        self.heap.with_stream(stream, |heap, s| s.prepend_data(heap, &text))?;
                    }
                    self.heap.downref(input)?;
                }
                None => {
                    pushed = PUSHED_TREE;
                    self.heap.with_stream(stream, |_, s| {
                        s.prepend_tree(input, ignore);
                        Ok(())
                    })?
                }
            }
        }
        self.heap.downref(target)?;
        self.push(Slot::Nil)?;
        if undo {
            self.rcode_finish(Opcode::StreamPushBkt, &[pushed])?;
        }
        Ok(())
    }

    pub(crate) fn exec_stream_push_bkt(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let target = self.pop_some()?;
        let stream = self.stream_of(target)?;
        let detached = match instr.word(0) {
            0 => None,
            PUSHED_TREE => self.heap.with_stream(stream, |_, s| Ok(s.undo_prepend_tree()))?,
            n => self
                .heap
                .with_stream(stream, |heap, s| s.undo_prepend_data(heap, n as usize))?,
        };
        self.heap.downref_opt(detached)?;
        self.heap.downref(target)
    }
}
