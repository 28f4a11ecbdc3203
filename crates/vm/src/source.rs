//! Backing sources behind input streams.
//!
//! A source produces input strictly forward. The owning
//! [`InputStream`](crate::input::InputStream) keeps everything it handed out
//! in its queue, so a source never has to give anything back except for
//! pattern placeholders, which are consumed and restored in place.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sprig_common::LangElId;

use crate::error::RuntimeError;
use crate::tree::{Heap, TreeRef};

/// What a fetch produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    Data(Vec<u8>),
    /// A tree to queue as a token. Ownership moves into the stream.
    Tree(TreeRef),
    /// Nothing now; more input may be appended later.
    Later,
    /// Nothing ever again.
    Eof,
}

/// A typed placeholder consumed from a pattern source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LangElMarker {
    pub id: LangElId,
    /// Pattern variable the placeholder binds.
    pub bind_id: u16,
}

/// Forward-only producer of stream input.
pub trait Source: fmt::Debug {
    /// Produce up to `max` bytes, or a tree.
    fn fetch(&mut self, heap: &mut Heap, max: usize) -> Result<Fetched, RuntimeError>;

    /// The placeholder the source is positioned on, if any.
    fn peek_lang_el(&self) -> Option<LangElId> {
        None
    }

    fn consume_lang_el(&mut self) -> Option<LangElMarker> {
        None
    }

    fn undo_consume_lang_el(&mut self) -> bool {
        false
    }

    /// Drop any trees the source still holds.
    fn release(&mut self, _heap: &mut Heap) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Reads a file. A short read marks the file as drained.
#[derive(Debug)]
pub struct FileSource {
    name: String,
    file: File,
    drained: bool,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        Ok(Self {
            name: path.display().to_string(),
            file: File::open(path)?,
            drained: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Source for FileSource {
    fn fetch(&mut self, _heap: &mut Heap, max: usize) -> Result<Fetched, RuntimeError> {
        if self.drained {
            return Ok(Fetched::Later);
        }
        let mut buf = vec![0u8; max];
        let mut have = 0;
        while have < max {
            let n = self.file.read(&mut buf[have..])?;
            if n == 0 {
                self.drained = true;
                break;
            }
            have += n;
        }
        buf.truncate(have);
        Ok(if buf.is_empty() {
            Fetched::Later
        } else {
            Fetched::Data(buf)
        })
    }
}

/// Reads any byte reader, typically a descriptor such as stdin. A read of
/// zero bytes means nothing more for now.
pub struct FdSource {
    reader: Box<dyn Read>,
}

impl FdSource {
    pub fn new(reader: Box<dyn Read>) -> Self {
        Self { reader }
    }

    pub fn stdin() -> Self {
        Self::new(Box::new(io::stdin()))
    }
}

impl fmt::Debug for FdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdSource").finish_non_exhaustive()
    }
}

impl Source for FdSource {
    fn fetch(&mut self, _heap: &mut Heap, max: usize) -> Result<Fetched, RuntimeError> {
        let mut buf = vec![0u8; max];
        let n = self.reader.read(&mut buf)?;
        if n == 0 {
            return Ok(Fetched::Later);
        }
        buf.truncate(n);
        Ok(Fetched::Data(buf))
    }
}

/// In-memory text.
#[derive(Debug, Clone)]
pub struct StringSource {
    data: Vec<u8>,
    pos: usize,
}

impl StringSource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

impl Source for StringSource {
    fn fetch(&mut self, _heap: &mut Heap, max: usize) -> Result<Fetched, RuntimeError> {
        if self.pos == self.data.len() {
            return Ok(Fetched::Later);
        }
        let end = (self.pos + max).min(self.data.len());
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(Fetched::Data(chunk))
    }
}

/// One element of a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternItem {
    Text(Vec<u8>),
    /// A typed variable, matched as a single language element.
    Var { id: LangElId, bind_id: u16 },
}

/// Literal pattern text interleaved with typed placeholders.
#[derive(Debug, Clone)]
pub struct PatternSource {
    items: Vec<PatternItem>,
    pos: usize,
}

impl PatternSource {
    pub fn new(items: Vec<PatternItem>) -> Self {
        Self { items, pos: 0 }
    }
}

impl Source for PatternSource {
    fn fetch(&mut self, _heap: &mut Heap, _max: usize) -> Result<Fetched, RuntimeError> {
        match self.items.get(self.pos) {
            None => Ok(Fetched::Eof),
            Some(PatternItem::Text(text)) => {
                self.pos += 1;
                Ok(Fetched::Data(text.clone()))
            }
            Some(PatternItem::Var { .. }) => Ok(Fetched::Later),
        }
    }

    fn peek_lang_el(&self) -> Option<LangElId> {
        match self.items.get(self.pos) {
            Some(PatternItem::Var { id, .. }) => Some(*id),
            _ => None,
        }
    }

    fn consume_lang_el(&mut self) -> Option<LangElMarker> {
        match self.items.get(self.pos) {
            Some(PatternItem::Var { id, bind_id }) => {
                self.pos += 1;
                Some(LangElMarker {
                    id: *id,
                    bind_id: *bind_id,
                })
            }
            _ => None,
        }
    }

    fn undo_consume_lang_el(&mut self) -> bool {
        match self.pos.checked_sub(1).and_then(|p| self.items.get(p)) {
            Some(PatternItem::Var { .. }) => {
                self.pos -= 1;
                true
            }
            _ => false,
        }
    }
}

/// One element of a replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplItem {
    Text(Vec<u8>),
    /// A bound tree substituted verbatim. The source owns one reference.
    Tree(TreeRef),
}

/// Replacement text interleaved with already-built trees.
#[derive(Debug, Clone)]
pub struct ReplSource {
    items: Vec<ReplItem>,
    pos: usize,
}

impl ReplSource {
    pub fn new(items: Vec<ReplItem>) -> Self {
        Self { items, pos: 0 }
    }
}

impl Source for ReplSource {
    fn fetch(&mut self, _heap: &mut Heap, _max: usize) -> Result<Fetched, RuntimeError> {
        let Some(item) = self.items.get(self.pos) else {
            return Ok(Fetched::Eof);
        };
        self.pos += 1;
        Ok(match item {
            ReplItem::Text(text) => Fetched::Data(text.clone()),
            ReplItem::Tree(t) => Fetched::Tree(*t),
        })
    }

    fn release(&mut self, heap: &mut Heap) -> Result<(), RuntimeError> {
        for item in self.items.drain(self.pos..) {
            if let ReplItem::Tree(t) = item {
                heap.downref(t)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{Input, InputStream};
    use std::io::{Cursor, Write};

    #[test]
    fn file_source_reads_then_drains() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"line one\nline two\n").unwrap();
        let mut heap = Heap::new();
        let mut s = InputStream::with_source(Box::new(FileSource::open(file.path()).unwrap()));
        assert_eq!(s.pull(&mut heap, 8).unwrap(), b"line one".to_vec());
        s.consume_data(&mut heap, 18).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(s.get_data(&mut heap, 0, &mut buf).unwrap(), Input::Eod);
        s.set_eof();
        assert_eq!(s.get_data(&mut heap, 0, &mut buf).unwrap(), Input::Eof);
    }

    #[test]
    fn fd_source_reads_reader() {
        let mut heap = Heap::new();
        let mut s = InputStream::with_source(Box::new(FdSource::new(Box::new(Cursor::new(b"xyz".to_vec())))));
        assert_eq!(s.pull(&mut heap, 10).unwrap(), b"xyz".to_vec());
        assert!(s.later);
    }

    #[test]
    fn pattern_source_yields_placeholders() {
        let mut heap = Heap::new();
        let pattern = PatternSource::new(vec![
            PatternItem::Text(b"a ".to_vec()),
            PatternItem::Var { id: 12, bind_id: 1 },
            PatternItem::Text(b" b".to_vec()),
        ]);
        let mut s = InputStream::with_source(Box::new(pattern));
        let mut buf = [0u8; 8];
        assert_eq!(s.get_data(&mut heap, 0, &mut buf).unwrap(), Input::Data(2));
        s.consume_data(&mut heap, 2).unwrap();
        assert_eq!(s.get_data(&mut heap, 0, &mut buf).unwrap(), Input::LangEl(12));
        let marker = s.consume_lang_el(&mut heap).unwrap().unwrap();
        assert_eq!(marker, LangElMarker { id: 12, bind_id: 1 });
        assert!(s.undo_consume_lang_el(&mut heap).unwrap());
        assert_eq!(s.get_data(&mut heap, 0, &mut buf).unwrap(), Input::LangEl(12));
        s.consume_lang_el(&mut heap).unwrap();
        assert_eq!(s.pull(&mut heap, 8).unwrap(), b" b".to_vec());
        s.consume_data(&mut heap, 2).unwrap();
        assert_eq!(s.get_data(&mut heap, 0, &mut buf).unwrap(), Input::Eof);
    }

    #[test]
    fn repl_source_queues_trees() {
        let mut heap = Heap::new();
        let t = heap.int(1);
        let repl = ReplSource::new(vec![ReplItem::Text(b"x".to_vec()), ReplItem::Tree(t)]);
        let mut s = InputStream::with_source(Box::new(repl));
        assert_eq!(s.pull(&mut heap, 4).unwrap(), b"x".to_vec());
        s.consume_data(&mut heap, 1).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(s.get_data(&mut heap, 0, &mut buf).unwrap(), Input::Tree);
        assert_eq!(s.consume_tree(&mut heap).unwrap(), Some(t));
        heap.downref(t).unwrap();
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn repl_source_releases_unread_trees() {
        let mut heap = Heap::new();
        let t = heap.int(1);
        let mut repl = ReplSource::new(vec![ReplItem::Tree(t)]);
        repl.release(&mut heap).unwrap();
        assert!(!heap.is_live(t));
    }
}
