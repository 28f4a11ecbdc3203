//! Reference-counted, copy-on-write trees.
//!
//! Trees live in a [`Heap`] arena and are addressed by [`TreeRef`] handles.
//! Every owning handle accounts for one unit of the tree's reference count.
//! A tree whose count reaches zero is released immediately, and everything
//! it owns is released transitively through an explicit worklist.
//!
//! A tree with more than one reference is never mutated in place. Writers
//! call [`Heap::split`] first, rewrite the owning slot with the result, and
//! mutate the copy.

use std::cmp::Ordering;

use sprig_common::lang_el::{LangElId, ID_BOOL, ID_INT, ID_PTR, ID_STR, ID_STREAM};

use crate::error::RuntimeError;
use crate::input::{InputStream, RunBuf};
use crate::map::Map;
use crate::pcr::Accum;
use crate::rcode;

/// Handle to a tree in a [`Heap`].
///
/// The generation makes a handle to a freed slot detectable instead of
/// silently aliasing whatever reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeRef {
    index: u32,
    gen: u32,
}

impl TreeRef {
    /// Encode an optional handle as a reverse-code word. Zero is nil.
    pub fn to_word(tree: Option<TreeRef>) -> u64 {
        match tree {
            None => 0,
            Some(t) => ((t.gen as u64) << 32) | (t.index as u64 + 1),
        }
    }

    /// Inverse of [`TreeRef::to_word`].
    pub fn from_word(word: u64) -> Option<TreeRef> {
        if word == 0 {
            return None;
        }
        Some(TreeRef {
            index: (word as u32).wrapping_sub(1),
            gen: (word >> 32) as u32,
        })
    }

    /// Arena slot number, for diagnostics.
    pub fn index(self) -> u32 {
        self.index
    }
}

/// Per-tree flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TreeFlags(u8);

impl TreeFlags {
    /// The tree is a parse-tree node rather than a plain value.
    pub const PARSE_TREE: TreeFlags = TreeFlags(0x01);
    /// Constructed by code, not by scanning input.
    pub const ARTIFICIAL: TreeFlags = TreeFlags(0x02);
    /// Produced by a finished parse.
    pub const PARSED: TreeFlags = TreeFlags(0x04);

    pub fn empty() -> Self {
        TreeFlags(0)
    }

    pub fn contains(self, other: TreeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: TreeFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: TreeFlags) {
        self.0 &= !other.0;
    }
}

/// Position of token text in its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub line: u32,
    pub column: u32,
    pub byte: u64,
}

/// Token text buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Head {
    pub data: Vec<u8>,
    pub location: Option<Location>,
}

impl Head {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            location: None,
        }
    }

    pub fn located(data: impl Into<Vec<u8>>, location: Location) -> Self {
        Self {
            data: data.into(),
            location: Some(location),
        }
    }
}

/// Map payload keyed and valued by trees, ordered by [`Heap::cmp_tree`].
pub type TreeMap = Map<TreeRef, TreeRef>;

/// Kind-specific part of a tree.
#[derive(Debug)]
pub enum Payload {
    /// Plain node: only attributes, children and token text.
    Node,
    Int(i64),
    Str(Head),
    Pointer(Option<TreeRef>),
    List(Vec<TreeRef>),
    Map(Box<TreeMap>),
    Stream(Box<InputStream>),
    Accum(Box<Accum>),
    /// Container temporarily checked out by `Heap::with_*`.
    Taken,
}

impl Payload {
    fn kind(&self) -> &'static str {
        match self {
            Payload::Node => "node",
            Payload::Int(_) => "int",
            Payload::Str(_) => "str",
            Payload::Pointer(_) => "pointer",
            Payload::List(_) => "list",
            Payload::Map(_) => "map",
            Payload::Stream(_) => "stream",
            Payload::Accum(_) => "accum",
            Payload::Taken => "taken",
        }
    }
}

/// A tree node.
#[derive(Debug)]
pub struct Tree {
    pub id: LangElId,
    refs: u32,
    pub flags: TreeFlags,
    /// Grammar alternative that built the node, or 0.
    pub prod_num: u16,
    pub attrs: Vec<Option<TreeRef>>,
    pub children: Vec<TreeRef>,
    pub tokdata: Option<Head>,
    pub payload: Payload,
}

impl Tree {
    pub fn new(id: LangElId, payload: Payload) -> Self {
        Self {
            id,
            refs: 0,
            flags: TreeFlags::empty(),
            prod_num: 0,
            attrs: Vec::new(),
            children: Vec::new(),
            tokdata: None,
            payload,
        }
    }

    /// A token carrying `text`.
    pub fn token(id: LangElId, text: impl Into<Vec<u8>>) -> Self {
        let mut tree = Tree::new(id, Payload::Node);
        tree.tokdata = Some(Head::new(text));
        tree
    }

    pub fn refs(&self) -> u32 {
        self.refs
    }

    pub fn attr(&self, field: usize) -> Option<TreeRef> {
        self.attrs.get(field).copied().flatten()
    }

    /// Every tree this node holds a reference to.
    fn owned(&self, out: &mut Vec<TreeRef>) {
        out.extend(self.attrs.iter().flatten());
        out.extend(&self.children);
        match &self.payload {
            Payload::Pointer(Some(t)) => out.push(*t),
            Payload::List(items) => out.extend(items),
            Payload::Map(map) => {
                for (k, v) in map.iter() {
                    out.push(*k);
                    out.push(*v);
                }
            }
            _ => {}
        }
    }
}

struct Cell {
    gen: u32,
    tree: Option<Tree>,
}

/// Arena of trees.
#[derive(Default)]
pub struct Heap {
    cells: Vec<Cell>,
    free: Vec<u32>,
    live: usize,
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("cells", &self.cells.len())
            .field("live", &self.live)
            .finish()
    }
}

fn stale(t: TreeRef) -> RuntimeError {
    RuntimeError::StaleHandle { index: t.index }
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of trees currently alive.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Store `tree` with a reference count of one, owned by the caller.
    pub fn alloc(&mut self, mut tree: Tree) -> TreeRef {
        tree.refs = 1;
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let cell = &mut self.cells[index as usize];
            cell.tree = Some(tree);
            return TreeRef {
                index,
                gen: cell.gen,
            };
        }
        let index = self.cells.len() as u32;
        self.cells.push(Cell {
            gen: 0,
            tree: Some(tree),
        });
        TreeRef { index, gen: 0 }
    }

    pub fn int(&mut self, value: i64) -> TreeRef {
        self.alloc(Tree::new(ID_INT, Payload::Int(value)))
    }

    pub fn string(&mut self, text: impl Into<Vec<u8>>) -> TreeRef {
        self.alloc(Tree::new(ID_STR, Payload::Str(Head::new(text))))
    }

    pub fn pointer(&mut self, target: Option<TreeRef>) -> TreeRef {
        self.alloc(Tree::new(ID_PTR, Payload::Pointer(target)))
    }

    pub fn boolean(&mut self, value: bool) -> TreeRef {
        self.alloc(Tree::new(ID_BOOL, Payload::Int(value as i64)))
    }

    pub fn list(&mut self, id: LangElId) -> TreeRef {
        self.alloc(Tree::new(id, Payload::List(Vec::new())))
    }

    pub fn map(&mut self, id: LangElId) -> TreeRef {
        self.alloc(Tree::new(id, Payload::Map(Box::default())))
    }

    pub fn stream(&mut self, stream: InputStream) -> TreeRef {
        self.alloc(Tree::new(ID_STREAM, Payload::Stream(Box::new(stream))))
    }

    pub fn is_live(&self, t: TreeRef) -> bool {
        self.get(t).is_ok()
    }

    /// Current reference count, zero for a freed tree.
    pub fn refs(&self, t: TreeRef) -> u32 {
        self.get(t).map(|tree| tree.refs).unwrap_or(0)
    }

    pub fn get(&self, t: TreeRef) -> Result<&Tree, RuntimeError> {
        match self.cells.get(t.index as usize) {
            Some(Cell {
                gen,
                tree: Some(tree),
            }) if *gen == t.gen => Ok(tree),
            _ => Err(stale(t)),
        }
    }

    pub fn get_mut(&mut self, t: TreeRef) -> Result<&mut Tree, RuntimeError> {
        match self.cells.get_mut(t.index as usize) {
            Some(Cell {
                gen,
                tree: Some(tree),
            }) if *gen == t.gen => Ok(tree),
            _ => Err(stale(t)),
        }
    }

    pub fn upref(&mut self, t: TreeRef) -> Result<(), RuntimeError> {
        self.get_mut(t)?.refs += 1;
        Ok(())
    }

    pub fn upref_opt(&mut self, t: Option<TreeRef>) -> Result<(), RuntimeError> {
        match t {
            Some(t) => self.upref(t),
            None => Ok(()),
        }
    }

    /// Drop one reference, releasing the tree and everything it owns at zero.
    pub fn downref(&mut self, t: TreeRef) -> Result<(), RuntimeError> {
        let tree = self.get_mut(t)?;
        tree.refs -= 1;
        if tree.refs == 0 {
            self.release(t)?;
        }
        Ok(())
    }

    pub fn downref_opt(&mut self, t: Option<TreeRef>) -> Result<(), RuntimeError> {
        match t {
            Some(t) => self.downref(t),
            None => Ok(()),
        }
    }

    fn release(&mut self, first: TreeRef) -> Result<(), RuntimeError> {
        let mut dead = vec![first];
        let mut owned = Vec::new();
        while let Some(t) = dead.pop() {
            let cell = &mut self.cells[t.index as usize];
            let Some(mut tree) = cell.tree.take() else {
                return Err(stale(t));
            };
            cell.gen = cell.gen.wrapping_add(1);
            self.free.push(t.index);
            self.live -= 1;

            tree.owned(&mut owned);
            match std::mem::replace(&mut tree.payload, Payload::Node) {
                Payload::Stream(mut stream) => {
                    for buf in stream.queue.drain(..) {
                        match buf {
                            RunBuf::Token(t) | RunBuf::Ignore(t) | RunBuf::Source(t) => owned.push(t),
                            RunBuf::Data { .. } => {}
                        }
                    }
                    if let Some(mut source) = stream.source.take() {
                        source.release(self)?;
                    }
                }
                Payload::Accum(mut accum) => {
                    owned.push(accum.stream);
                    owned.extend(accum.result.take());
                    let run = &mut accum.run;
                    owned.extend(run.context.take());
                    owned.extend(run.parse_error.take());
                    owned.extend(run.red_lel.take());
                    owned.extend(run.input1.take());
                    owned.extend(run.parsed.take());
                    rcode::downref_collect(self, &mut run.rcode_collect)?;
                    rcode::downref_all(self, &mut run.reverse_code)?;
                    if let Some(mut driver) = accum.driver.take() {
                        driver.release(self)?;
                    }
                }
                _ => {}
            }

            for t in owned.drain(..) {
                let tree = self.get_mut(t)?;
                tree.refs -= 1;
                if tree.refs == 0 {
                    dead.push(t);
                }
            }
        }
        Ok(())
    }

    /// Shallow copy with a count of one. Everything the original owns gains
    /// a reference from the copy.
    pub fn copy_tree(&mut self, t: TreeRef) -> Result<TreeRef, RuntimeError> {
        let src = self.get(t)?;
        let payload = match &src.payload {
            Payload::Node => Payload::Node,
            Payload::Int(v) => Payload::Int(*v),
            Payload::Str(h) => Payload::Str(h.clone()),
            Payload::Pointer(p) => Payload::Pointer(*p),
            Payload::List(items) => Payload::List(items.clone()),
            Payload::Map(map) => Payload::Map(map.clone()),
            other => {
                return Err(RuntimeError::invariant(
                    0,
                    format!("cannot copy a {} tree", other.kind()),
                ))
            }
        };
        let mut copy = Tree::new(src.id, payload);
        copy.flags = src.flags;
        copy.prod_num = src.prod_num;
        copy.attrs = src.attrs.clone();
        copy.children = src.children.clone();
        copy.tokdata = src.tokdata.clone();

        let mut owned = Vec::new();
        copy.owned(&mut owned);
        for o in owned {
            self.upref(o)?;
        }
        Ok(self.alloc(copy))
    }

    /// Make `t` safe to mutate.
    ///
    /// With a single reference the tree itself is returned. Otherwise a copy
    /// takes over the caller's reference and the caller must store the copy
    /// back into the slot it read `t` from. Streams and accumulators are
    /// identity objects and are never copied.
    pub fn split(&mut self, t: TreeRef) -> Result<TreeRef, RuntimeError> {
        let tree = self.get(t)?;
        if tree.refs <= 1 || matches!(tree.payload, Payload::Stream(_) | Payload::Accum(_)) {
            return Ok(t);
        }
        let copy = self.copy_tree(t)?;
        self.downref(t)?;
        Ok(copy)
    }

    pub fn attr(&self, t: TreeRef, field: usize) -> Result<Option<TreeRef>, RuntimeError> {
        Ok(self.get(t)?.attr(field))
    }

    /// Replace an attribute, returning the previous value. The new value's
    /// reference moves into the tree; the old one moves to the caller.
    pub fn set_attr(
        &mut self,
        t: TreeRef,
        field: usize,
        value: Option<TreeRef>,
    ) -> Result<Option<TreeRef>, RuntimeError> {
        let tree = self.get_mut(t)?;
        if tree.attrs.len() <= field {
            tree.attrs.resize(field + 1, None);
        }
        Ok(std::mem::replace(&mut tree.attrs[field], value))
    }

    /// Split the attribute in place and return the unique result.
    pub fn split_attr(&mut self, t: TreeRef, field: usize) -> Result<Option<TreeRef>, RuntimeError> {
        let Some(value) = self.attr(t, field)? else {
            return Ok(None);
        };
        let unique = self.split(value)?;
        if unique != value {
            self.set_attr(t, field, Some(unique))?;
        }
        Ok(Some(unique))
    }

    pub fn child(&self, t: TreeRef, pos: usize) -> Result<Option<TreeRef>, RuntimeError> {
        Ok(self.get(t)?.children.get(pos).copied())
    }

    pub fn set_child(&mut self, t: TreeRef, pos: usize, value: TreeRef) -> Result<TreeRef, RuntimeError> {
        let tree = self.get_mut(t)?;
        let slot = tree
            .children
            .get_mut(pos)
            .ok_or_else(|| RuntimeError::invariant(0, format!("no child {pos}")))?;
        Ok(std::mem::replace(slot, value))
    }

    pub fn split_child(&mut self, t: TreeRef, pos: usize) -> Result<Option<TreeRef>, RuntimeError> {
        let Some(kid) = self.child(t, pos)? else {
            return Ok(None);
        };
        let unique = self.split(kid)?;
        if unique != kid {
            self.set_child(t, pos, unique)?;
        }
        Ok(Some(unique))
    }

    pub fn int_value(&self, t: TreeRef) -> Result<Option<i64>, RuntimeError> {
        Ok(match self.get(t)?.payload {
            Payload::Int(v) => Some(v),
            _ => None,
        })
    }

    pub fn str_value(&self, t: TreeRef) -> Result<Option<&[u8]>, RuntimeError> {
        Ok(match &self.get(t)?.payload {
            Payload::Str(h) => Some(h.data.as_slice()),
            _ => None,
        })
    }

    pub fn list_items(&self, t: TreeRef) -> Result<Option<&[TreeRef]>, RuntimeError> {
        Ok(match &self.get(t)?.payload {
            Payload::List(items) => Some(items.as_slice()),
            _ => None,
        })
    }

    pub fn list_items_mut(&mut self, t: TreeRef) -> Result<Option<&mut Vec<TreeRef>>, RuntimeError> {
        Ok(match &mut self.get_mut(t)?.payload {
            Payload::List(items) => Some(items),
            _ => None,
        })
    }

    /// Run `f` with the map payload checked out, so `f` may use the heap.
    pub fn with_map<R>(
        &mut self,
        t: TreeRef,
        f: impl FnOnce(&mut Heap, &mut TreeMap) -> Result<R, RuntimeError>,
    ) -> Result<R, RuntimeError> {
        let tree = self.get_mut(t)?;
        let mut map = match std::mem::replace(&mut tree.payload, Payload::Taken) {
            Payload::Map(map) => map,
            other => {
                let kind = other.kind();
                tree.payload = other;
                return Err(RuntimeError::invariant(0, format!("expected map, found {kind}")));
            }
        };
        let result = f(self, &mut map);
        self.get_mut(t)?.payload = Payload::Map(map);
        result
    }

    /// Run `f` with the stream payload checked out.
    pub fn with_stream<R>(
        &mut self,
        t: TreeRef,
        f: impl FnOnce(&mut Heap, &mut InputStream) -> Result<R, RuntimeError>,
    ) -> Result<R, RuntimeError> {
        let tree = self.get_mut(t)?;
        let mut stream = match std::mem::replace(&mut tree.payload, Payload::Taken) {
            Payload::Stream(stream) => stream,
            other => {
                let kind = other.kind();
                tree.payload = other;
                return Err(RuntimeError::invariant(0, format!("expected stream, found {kind}")));
            }
        };
        let result = f(self, &mut stream);
        self.get_mut(t)?.payload = Payload::Stream(stream);
        result
    }

    /// Run `f` with the accumulator payload checked out.
    pub fn with_accum<R>(
        &mut self,
        t: TreeRef,
        f: impl FnOnce(&mut Heap, &mut Accum) -> Result<R, RuntimeError>,
    ) -> Result<R, RuntimeError> {
        let tree = self.get_mut(t)?;
        let mut accum = match std::mem::replace(&mut tree.payload, Payload::Taken) {
            Payload::Accum(accum) => accum,
            other => {
                let kind = other.kind();
                tree.payload = other;
                return Err(RuntimeError::invariant(0, format!("expected accum, found {kind}")));
            }
        };
        let result = f(self, &mut accum);
        self.get_mut(t)?.payload = Payload::Accum(accum);
        result
    }

    pub fn is_stream(&self, t: TreeRef) -> Result<bool, RuntimeError> {
        Ok(matches!(self.get(t)?.payload, Payload::Stream(_)))
    }

    pub fn is_accum(&self, t: TreeRef) -> Result<bool, RuntimeError> {
        Ok(matches!(self.get(t)?.payload, Payload::Accum(_)))
    }

    /// Total order over tree values. Nil sorts first; a stale handle
    /// compares like nil.
    pub fn cmp_tree(&self, a: Option<TreeRef>, b: Option<TreeRef>) -> Ordering {
        let a = a.and_then(|t| self.get(t).ok());
        let b = b.and_then(|t| self.get(t).ok());
        let (a, b) = match (a, b) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(a), Some(b)) => (a, b),
        };
        let by_id = a.id.cmp(&b.id);
        if by_id != Ordering::Equal {
            return by_id;
        }
        let by_payload = match (&a.payload, &b.payload) {
            (Payload::Int(x), Payload::Int(y)) => x.cmp(y),
            (Payload::Str(x), Payload::Str(y)) => x.data.cmp(&y.data),
            (Payload::Pointer(x), Payload::Pointer(y)) => {
                TreeRef::to_word(*x).cmp(&TreeRef::to_word(*y))
            }
            _ => Ordering::Equal,
        };
        if by_payload != Ordering::Equal {
            return by_payload;
        }
        let by_text = match (&a.tokdata, &b.tokdata) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.data.cmp(&y.data),
        };
        if by_text != Ordering::Equal {
            return by_text;
        }
        for (x, y) in a.children.iter().zip(&b.children) {
            let o = self.cmp_tree(Some(*x), Some(*y));
            if o != Ordering::Equal {
                return o;
            }
        }
        a.children.len().cmp(&b.children.len())
    }

    /// Text of a tree: string payload, integer digits, or the token text of
    /// the node and its children in order.
    pub fn text(&self, t: Option<TreeRef>) -> Result<Vec<u8>, RuntimeError> {
        let mut out = Vec::new();
        let mut todo: Vec<TreeRef> = t.into_iter().collect();
        while let Some(t) = todo.pop() {
            let tree = self.get(t)?;
            match &tree.payload {
                Payload::Str(h) => out.extend_from_slice(&h.data),
                Payload::Int(v) => out.extend_from_slice(v.to_string().as_bytes()),
                _ => {
                    if let Some(h) = &tree.tokdata {
                        out.extend_from_slice(&h.data);
                    }
                    todo.extend(tree.children.iter().rev());
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE: LangElId = 20;

    fn node_with(heap: &mut Heap, attrs: Vec<Option<TreeRef>>) -> TreeRef {
        let mut tree = Tree::new(NODE, Payload::Node);
        tree.attrs = attrs;
        heap.alloc(tree)
    }

    #[test]
    fn alloc_and_free() {
        let mut heap = Heap::new();
        let t = heap.int(7);
        assert_eq!(heap.refs(t), 1);
        assert_eq!(heap.live_count(), 1);
        heap.downref(t).unwrap();
        assert!(!heap.is_live(t));
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn stale_handle_detected_after_reuse() {
        let mut heap = Heap::new();
        let a = heap.int(1);
        heap.downref(a).unwrap();
        let b = heap.int(2);
        assert_eq!(a.index(), b.index());
        assert!(heap.get(a).is_err());
        assert_eq!(heap.downref(a), Err(RuntimeError::StaleHandle { index: a.index() }));
        assert_eq!(heap.int_value(b).unwrap(), Some(2));
    }

    #[test]
    fn release_is_transitive() {
        let mut heap = Heap::new();
        let leaf = heap.int(1);
        let mid = node_with(&mut heap, vec![Some(leaf)]);
        let list = heap.list(NODE);
        heap.list_items_mut(list).unwrap().unwrap().push(mid);
        let root = node_with(&mut heap, vec![None, Some(list)]);
        assert_eq!(heap.live_count(), 4);
        heap.downref(root).unwrap();
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn shared_child_survives_parent() {
        let mut heap = Heap::new();
        let leaf = heap.int(1);
        heap.upref(leaf).unwrap();
        let parent = node_with(&mut heap, vec![Some(leaf)]);
        heap.downref(parent).unwrap();
        assert_eq!(heap.refs(leaf), 1);
    }

    #[test]
    fn split_unique_is_identity() {
        let mut heap = Heap::new();
        let t = node_with(&mut heap, vec![]);
        assert_eq!(heap.split(t).unwrap(), t);
        assert_eq!(heap.live_count(), 1);
    }

    #[test]
    fn split_shared_copies() {
        let mut heap = Heap::new();
        let leaf = heap.int(5);
        let t = node_with(&mut heap, vec![Some(leaf)]);
        heap.upref(t).unwrap();

        let copy = heap.split(t).unwrap();
        assert_ne!(copy, t);
        assert_eq!(heap.refs(t), 1);
        assert_eq!(heap.refs(copy), 1);
        assert_eq!(heap.refs(leaf), 2);
        assert_eq!(heap.cmp_tree(Some(t), Some(copy)), Ordering::Equal);

        let other = heap.int(9);
        let old = heap.set_attr(copy, 0, Some(other)).unwrap();
        heap.downref_opt(old).unwrap();
        assert_eq!(heap.attr(t, 0).unwrap(), Some(leaf));
        assert_eq!(heap.refs(leaf), 1);
    }

    #[test]
    fn split_attr_rewrites_owner() {
        let mut heap = Heap::new();
        let inner = node_with(&mut heap, vec![]);
        heap.upref(inner).unwrap();
        let outer = node_with(&mut heap, vec![Some(inner)]);
        let unique = heap.split_attr(outer, 0).unwrap().unwrap();
        assert_ne!(unique, inner);
        assert_eq!(heap.attr(outer, 0).unwrap(), Some(unique));
        assert_eq!(heap.refs(inner), 1);
    }

    #[test]
    fn cmp_orders_values() {
        let mut heap = Heap::new();
        let a = heap.int(1);
        let b = heap.int(2);
        let s = heap.string("x");
        assert_eq!(heap.cmp_tree(Some(a), Some(b)), Ordering::Less);
        assert_eq!(heap.cmp_tree(None, Some(a)), Ordering::Less);
        assert_eq!(heap.cmp_tree(None, None), Ordering::Equal);
        assert_eq!(heap.cmp_tree(Some(a), Some(s)), Ordering::Less);
    }

    #[test]
    fn text_collects_tokens_in_order() {
        let mut heap = Heap::new();
        let x = heap.alloc(Tree::token(NODE, "x"));
        let y = heap.alloc(Tree::token(NODE, "y"));
        let mut parent = Tree::token(NODE, "<");
        parent.children = vec![x, y];
        let p = heap.alloc(parent);
        assert_eq!(heap.text(Some(p)).unwrap(), b"<xy".to_vec());
        let n = heap.int(-3);
        assert_eq!(heap.text(Some(n)).unwrap(), b"-3".to_vec());
    }

    #[test]
    fn word_encoding() {
        let mut heap = Heap::new();
        let t = heap.int(0);
        assert_eq!(TreeRef::from_word(TreeRef::to_word(Some(t))), Some(t));
        assert_eq!(TreeRef::from_word(0), None);
    }

    #[test]
    fn flags() {
        let mut f = TreeFlags::empty();
        f.insert(TreeFlags::PARSED);
        assert!(f.contains(TreeFlags::PARSED));
        assert!(!f.contains(TreeFlags::ARTIFICIAL));
        f.remove(TreeFlags::PARSED);
        assert_eq!(f, TreeFlags::empty());
    }
}
