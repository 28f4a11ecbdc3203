//! Input streams: a queue of typed run buffers in front of a backing source.
//!
//! Every stream owns a double-ended queue of [`RunBuf`]s. A buffer holds raw
//! bytes with a read offset, a tree handed back to the scanner as a token, an
//! ignored token, or a nested stream consumed by delegation. Consumption pops
//! from the head and backtracking pushes onto the head, so any kind of input
//! can be restored with the same structure.
//!
//! When the queue runs dry the stream asks its [`Source`] for more. Sources
//! only ever read forward; everything that can be undone lives in the queue.

use std::collections::VecDeque;

use tracing::trace;

use crate::error::RuntimeError;
use crate::source::{Fetched, LangElMarker, Source};
use crate::tree::{Heap, TreeRef};
use sprig_common::LangElId;

/// Largest data buffer created by [`InputStream::append_data`] and by
/// source fetches.
pub const FSM_BUFSIZE: usize = 8192;

/// One queue element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunBuf {
    /// Raw bytes; `bytes[offset..]` is still unread.
    Data { bytes: Vec<u8>, offset: usize },
    /// A tree to be handed to the parser as an already-scanned token.
    Token(TreeRef),
    /// A tree to be handed to the parser as ignored trivia.
    Ignore(TreeRef),
    /// A nested stream tree, read through its own queue.
    Source(TreeRef),
}

impl RunBuf {
    pub fn data(bytes: impl Into<Vec<u8>>) -> Self {
        RunBuf::Data {
            bytes: bytes.into(),
            offset: 0,
        }
    }

    /// The tree a non-data buffer carries.
    pub fn tree(&self) -> Option<TreeRef> {
        match self {
            RunBuf::Token(t) | RunBuf::Ignore(t) | RunBuf::Source(t) => Some(*t),
            RunBuf::Data { .. } => None,
        }
    }
}

/// Result of looking at the next piece of input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// This many bytes were copied.
    Data(usize),
    /// Nothing buffered and the source has nothing right now.
    Eod,
    /// Nothing buffered and the stream has been marked finished.
    Eof,
    /// A token tree is next.
    Tree,
    /// An ignored tree is next.
    Ignore,
    /// A typed placeholder from a pattern source is next.
    LangEl(LangElId),
}

/// A stream payload.
#[derive(Debug, Default)]
pub struct InputStream {
    pub(crate) queue: VecDeque<RunBuf>,
    /// Set explicitly once no more input will ever arrive.
    pub eof: bool,
    /// The source has nothing more for now.
    pub later: bool,
    /// Bytes consumed so far, net of undone consumption.
    pub consumed: u64,
    pub(crate) source: Option<Box<dyn Source>>,
}

impl InputStream {
    /// A stream fed only by appends.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(source: Box<dyn Source>) -> Self {
        Self {
            source: Some(source),
            ..Self::default()
        }
    }

    pub fn queue(&self) -> &VecDeque<RunBuf> {
        &self.queue
    }

    // ---- Queue primitives

    pub fn push_head(&mut self, buf: RunBuf) {
        self.queue.push_front(buf);
    }

    pub fn push_tail(&mut self, buf: RunBuf) {
        self.queue.push_back(buf);
    }

    pub fn pop_head(&mut self) -> Option<RunBuf> {
        self.queue.pop_front()
    }

    pub fn pop_tail(&mut self) -> Option<RunBuf> {
        self.queue.pop_back()
    }

    fn head_source(&self) -> Option<TreeRef> {
        match self.queue.front() {
            Some(RunBuf::Source(t)) => Some(*t),
            _ => None,
        }
    }

    /// Release a buffer removed from the queue that nobody takes over.
    fn discard(heap: &mut Heap, buf: Option<RunBuf>) -> Result<(), RuntimeError> {
        match buf.and_then(|b| b.tree()) {
            Some(t) => heap.downref(t),
            None => Ok(()),
        }
    }

    /// Ask the source for more input. True when a buffer was appended.
    fn fetch(&mut self, heap: &mut Heap) -> Result<bool, RuntimeError> {
        if self.later {
            return Ok(false);
        }
        let Some(source) = self.source.as_mut() else {
            return Ok(false);
        };
        let fetched = source.fetch(heap, FSM_BUFSIZE)?;
        trace!(target: "sprig::input", ?fetched, "source fetch");
        match fetched {
            Fetched::Data(bytes) if !bytes.is_empty() => {
                self.queue.push_back(RunBuf::data(bytes));
                Ok(true)
            }
            Fetched::Data(_) | Fetched::Later => {
                self.later = true;
                Ok(false)
            }
            Fetched::Eof => {
                self.later = true;
                self.eof = true;
                Ok(false)
            }
            Fetched::Tree(t) => {
                self.queue.push_back(RunBuf::Token(t));
                Ok(true)
            }
        }
    }

    fn pending_lang_el(&self) -> Option<LangElId> {
        if self.later {
            return None;
        }
        self.source.as_ref().and_then(|s| s.peek_lang_el())
    }

    /// Copy bytes after skipping `skip` buffered bytes, from at most one
    /// buffer, without consuming anything.
    pub fn get_data(
        &mut self,
        heap: &mut Heap,
        mut skip: usize,
        dest: &mut [u8],
    ) -> Result<Input, RuntimeError> {
        let mut i = 0;
        loop {
            if i == self.queue.len() {
                if let Some(id) = self.pending_lang_el() {
                    return Ok(Input::LangEl(id));
                }
                if self.fetch(heap)? {
                    continue;
                }
                return Ok(if self.eof { Input::Eof } else { Input::Eod });
            }
            match &self.queue[i] {
                RunBuf::Source(t) => {
                    let t = *t;
                    let got = heap.with_stream(t, |heap, inner| inner.get_data(heap, skip, dest))?;
                    if got == Input::Eod && self.eof {
                        return Ok(Input::Eof);
                    }
                    return Ok(got);
                }
                RunBuf::Token(_) => return Ok(Input::Tree),
                RunBuf::Ignore(_) => return Ok(Input::Ignore),
                RunBuf::Data { bytes, offset } => {
                    let avail = &bytes[*offset..];
                    if skip >= avail.len() {
                        skip -= avail.len();
                    } else {
                        let src = &avail[skip..];
                        let n = src.len().min(dest.len());
                        dest[..n].copy_from_slice(&src[..n]);
                        return Ok(Input::Data(n));
                    }
                }
            }
            i += 1;
        }
    }

    /// Gather up to `len` bytes across buffers without consuming them. Stops
    /// early at a tree, a placeholder, or the end of available input.
    pub fn pull(&mut self, heap: &mut Heap, len: usize) -> Result<Vec<u8>, RuntimeError> {
        let mut out = vec![0u8; len];
        let mut have = 0;
        while have < len {
            match self.get_data(heap, have, &mut out[have..])? {
                Input::Data(n) if n > 0 => have += n,
                _ => break,
            }
        }
        out.truncate(have);
        Ok(out)
    }

    /// Advance past `length` bytes, freeing drained buffers. Returns the
    /// number of bytes actually consumed.
    pub fn consume_data(&mut self, heap: &mut Heap, mut length: usize) -> Result<usize, RuntimeError> {
        trace!(target: "sprig::input", length, "consume data");
        let mut consumed = 0;
        loop {
            let Some(front) = self.queue.front_mut() else {
                break;
            };
            match front {
                RunBuf::Source(t) => {
                    let t = *t;
                    let n = heap.with_stream(t, |heap, inner| inner.consume_data(heap, length))?;
                    consumed += n;
                    length -= n;
                }
                RunBuf::Token(_) | RunBuf::Ignore(_) => break,
                RunBuf::Data { bytes, offset } => {
                    let n = (bytes.len() - *offset).min(length);
                    consumed += n;
                    length -= n;
                    *offset += n;
                }
            }
            if length == 0 {
                break;
            }
            let popped = self.queue.pop_front();
            Self::discard(heap, popped)?;
        }
        self.consumed += consumed as u64;
        Ok(consumed)
    }

    /// Put consumed bytes back in front of the queue.
    pub fn undo_consume_data(&mut self, heap: &mut Heap, data: &[u8]) -> Result<usize, RuntimeError> {
        if let Some(t) = self.head_source() {
            return heap.with_stream(t, |heap, inner| inner.undo_consume_data(heap, data));
        }
        trace!(target: "sprig::input", length = data.len(), "undo consume data");
        self.queue.push_front(RunBuf::data(data));
        self.consumed = self.consumed.saturating_sub(data.len() as u64);
        Ok(data.len())
    }

    /// Take the token or ignored tree at the head, skipping drained data.
    /// Ownership of the tree moves to the caller.
    pub fn consume_tree(&mut self, heap: &mut Heap) -> Result<Option<TreeRef>, RuntimeError> {
        while matches!(self.queue.front(), Some(RunBuf::Data { bytes, offset }) if *offset == bytes.len())
        {
            self.queue.pop_front();
        }
        match self.queue.front() {
            Some(RunBuf::Token(_)) | Some(RunBuf::Ignore(_)) => {
                Ok(self.queue.pop_front().and_then(|b| b.tree()))
            }
            Some(RunBuf::Source(t)) => {
                let t = *t;
                heap.with_stream(t, |heap, inner| inner.consume_tree(heap))
            }
            _ => Ok(None),
        }
    }

    /// Hand a consumed tree back; the queue takes over its reference.
    pub fn undo_consume_tree(&mut self, tree: TreeRef, ignore: bool) {
        self.queue.push_front(if ignore {
            RunBuf::Ignore(tree)
        } else {
            RunBuf::Token(tree)
        });
    }

    /// Take the placeholder a pattern source is positioned on.
    pub fn consume_lang_el(&mut self, heap: &mut Heap) -> Result<Option<LangElMarker>, RuntimeError> {
        if let Some(t) = self.head_source() {
            return heap.with_stream(t, |heap, inner| inner.consume_lang_el(heap));
        }
        Ok(self.source.as_mut().and_then(|s| s.consume_lang_el()))
    }

    pub fn undo_consume_lang_el(&mut self, heap: &mut Heap) -> Result<bool, RuntimeError> {
        if let Some(t) = self.head_source() {
            return heap.with_stream(t, |heap, inner| inner.undo_consume_lang_el(heap));
        }
        Ok(self.source.as_mut().map(|s| s.undo_consume_lang_el()).unwrap_or(false))
    }

    /// Push text in front of the stream for rescanning.
    pub fn prepend_data(&mut self, heap: &mut Heap, data: &[u8]) -> Result<(), RuntimeError> {
        if let Some(t) = self.head_source() {
            return heap.with_stream(t, |heap, inner| inner.prepend_data(heap, data));
        }
        self.queue.push_front(RunBuf::data(data));
        Ok(())
    }

    /// Push a tree in front of the stream. The queue takes over the reference.
    pub fn prepend_tree(&mut self, tree: TreeRef, ignore: bool) {
        self.undo_consume_tree(tree, ignore);
    }

    /// Detach the tree a [`prepend_tree`](Self::prepend_tree) put at the head.
    pub fn undo_prepend_tree(&mut self) -> Option<TreeRef> {
        match self.queue.front() {
            Some(RunBuf::Token(_)) | Some(RunBuf::Ignore(_)) => self.queue.pop_front().and_then(|b| b.tree()),
            _ => None,
        }
    }

    /// Remove what a prepend added: `length` bytes, or with a zero length
    /// the head tree, whose reference moves to the caller.
    pub fn undo_prepend_data(
        &mut self,
        heap: &mut Heap,
        length: usize,
    ) -> Result<Option<TreeRef>, RuntimeError> {
        if let Some(t) = self.head_source() {
            return heap.with_stream(t, |heap, inner| inner.undo_prepend_data(heap, length));
        }
        match self.queue.front() {
            Some(RunBuf::Data { .. }) => {
                let mut left = length;
                while left > 0 {
                    let Some(RunBuf::Data { bytes, offset }) = self.queue.front_mut() else {
                        break;
                    };
                    let n = (bytes.len() - *offset).min(left);
                    *offset += n;
                    left -= n;
                    if *offset == bytes.len() {
                        self.queue.pop_front();
                    }
                }
                Ok(None)
            }
            Some(_) => Ok(self.queue.pop_front().and_then(|b| b.tree())),
            None => Ok(None),
        }
    }

    /// Feed more text at the back, split into buffers of at most
    /// [`FSM_BUFSIZE`] bytes.
    pub fn append_data(&mut self, data: &[u8]) {
        trace!(target: "sprig::input", length = data.len(), "append data");
        for chunk in data.chunks(FSM_BUFSIZE) {
            self.queue.push_back(RunBuf::data(chunk));
        }
    }

    /// Remove `length` bytes from the back, or with a non-data tail pop it
    /// and hand its tree to the caller.
    pub fn undo_append_data(&mut self, length: usize) -> Option<TreeRef> {
        match self.queue.back() {
            Some(RunBuf::Data { .. }) => {
                let mut left = length;
                while left > 0 {
                    let Some(RunBuf::Data { bytes, offset }) = self.queue.back_mut() else {
                        break;
                    };
                    let avail = bytes.len() - *offset;
                    if left >= avail {
                        left -= avail;
                        self.queue.pop_back();
                    } else {
                        let keep = bytes.len() - left;
                        bytes.truncate(keep);
                        left = 0;
                    }
                }
                None
            }
            Some(_) => self.queue.pop_back().and_then(|b| b.tree()),
            None => None,
        }
    }

    /// Append a tree as a token; the queue takes over the reference.
    pub fn append_tree(&mut self, tree: TreeRef) {
        self.queue.push_back(RunBuf::Token(tree));
    }

    pub fn undo_append_tree(&mut self) -> Option<TreeRef> {
        self.undo_append_stream()
    }

    /// Nest another stream tree as one queue element.
    pub fn append_stream(&mut self, stream: TreeRef) {
        self.queue.push_back(RunBuf::Source(stream));
    }

    /// Detach the tail element intact and return its tree.
    pub fn undo_append_stream(&mut self) -> Option<TreeRef> {
        match self.queue.back() {
            Some(RunBuf::Data { .. }) | None => None,
            Some(_) => self.queue.pop_back().and_then(|b| b.tree()),
        }
    }

    pub fn set_eof(&mut self) {
        trace!(target: "sprig::input", "set eof");
        self.eof = true;
    }

    /// Clear end of file on the stream being read: a nested head source if
    /// there is one, otherwise this stream.
    pub fn unset_eof(&mut self, heap: &mut Heap) -> Result<(), RuntimeError> {
        if let Some(t) = self.head_source() {
            return heap.with_stream(t, |_, inner| {
                inner.eof = false;
                Ok(())
            });
        }
        self.eof = false;
        Ok(())
    }
}
