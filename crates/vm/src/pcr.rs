//! Parse continuations.
//!
//! An accumulator is an embedded parser: an external [`ParseDriver`], the
//! [`ParseRun`] state the VM shares with it, and the input stream it reads.
//! The driver never calls back into the VM. When it needs grammar action
//! code run (a reduction) or reverse code replayed (backtracking), it stores
//! the request in [`ParseRun::action`] and returns the [`Pcr`] at which it
//! wants to be resumed. The VM runs the action and calls back in with that
//! code.
//!
//! [`parse_frag`], [`parse_finish`] and [`undo_parse_frag`] are the
//! resumable procedures the parse instructions drive. Each is an explicit
//! state machine over its `entry` code.

use std::fmt;

use sprig_common::lang_el::ID_ACCUM;
use tracing::{debug, trace};

use crate::error::RuntimeError;
use crate::input::InputStream;
use crate::rcode::{self, RtCodeVect};
use crate::tree::{Head, Heap, Payload, Tree, TreeFlags, TreeRef};

/// Resumption point of a suspended parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pcr {
    Start,
    Reduction,
    Generation,
    PreEof,
    RevIgnore,
    RevIgnore2,
    RevToken,
    RevToken2,
    RevReduction,
    RevReduction2,
    Done,
}

const ALL_PCR: [Pcr; 11] = [
    Pcr::Start,
    Pcr::Reduction,
    Pcr::Generation,
    Pcr::PreEof,
    Pcr::RevIgnore,
    Pcr::RevIgnore2,
    Pcr::RevToken,
    Pcr::RevToken2,
    Pcr::RevReduction,
    Pcr::RevReduction2,
    Pcr::Done,
];

impl Pcr {
    /// Stack encoding.
    pub fn to_word(self) -> u64 {
        ALL_PCR.iter().position(|p| *p == self).unwrap_or(0) as u64
    }

    pub fn from_word(word: u64) -> Option<Pcr> {
        ALL_PCR.get(word as usize).copied()
    }
}

/// Code the driver asks the VM to run before resuming it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    None,
    /// Run a frame's action code. The undo-logging entry is used when
    /// [`ParseRun::revert_on`] is set.
    Frame { frame_id: u16 },
    /// Replay one reverse-code group.
    Revert(Vec<u8>),
}

/// Parser state shared between the VM and the driver.
#[derive(Debug, Default)]
pub struct ParseRun {
    /// Parse steps taken, net of undone ones.
    pub steps: u64,
    /// While undoing, the step count to back up to.
    pub target_steps: Option<u64>,
    pub trigger_undo: bool,
    pub num_retry: u32,
    /// Language element that ends a fragment parse, or 0.
    pub stop_target: u16,
    /// Set by action code to reject the current reduction.
    pub reject: bool,
    /// A reduction's action has run but its reverse code is still live.
    pub on_deck: bool,
    /// Actions run with undo logging.
    pub revert_on: bool,
    /// Error tree of a failed parse.
    pub parse_error: Option<TreeRef>,
    /// Context object available to actions.
    pub context: Option<TreeRef>,
    /// Text of the token being matched.
    pub tokdata: Option<Head>,
    /// Node being reduced.
    pub red_lel: Option<TreeRef>,
    /// Current input token.
    pub input1: Option<TreeRef>,
    /// Left-hand side kept by `INIT_LHS_EL` for the driver.
    pub parsed: Option<TreeRef>,
    pub action: Action,
    /// Frame of the action being run.
    pub frame_id: u16,
    pub rcode_collect: RtCodeVect,
    pub reverse_code: RtCodeVect,
}

impl ParseRun {
    pub fn new(revert_on: bool) -> Self {
        Self {
            revert_on,
            ..Self::default()
        }
    }

    /// Finalize the reverse code of the action that just ran.
    pub fn make_reverse_code(&mut self) -> Result<bool, RuntimeError> {
        rcode::make_reverse_code(&mut self.rcode_collect, &mut self.reverse_code)
    }

    /// Request replay of the topmost reverse group. False when there is none.
    pub fn schedule_revert(&mut self) -> bool {
        match self.reverse_code.pop_group() {
            Some(group) => {
                self.action = Action::Revert(group);
                true
            }
            None => false,
        }
    }
}

/// What a driver sees while it runs.
pub struct DriverCx<'a> {
    pub heap: &'a mut Heap,
    pub run: &'a mut ParseRun,
    /// The accumulator's input stream tree.
    pub stream: TreeRef,
}

/// The external parse engine behind an accumulator.
pub trait ParseDriver: fmt::Debug {
    /// Advance the parse from `entry`. Returns [`Pcr::Done`] when the parse
    /// cannot progress further, or a resumption point after setting
    /// `cx.run.action`.
    fn parse_loop(&mut self, cx: &mut DriverCx<'_>, entry: Pcr) -> Result<Pcr, RuntimeError>;

    /// Make everything parsed so far permanent.
    fn commit_full(&mut self, cx: &mut DriverCx<'_>) -> Result<(), RuntimeError> {
        rcode::downref_all(cx.heap, &mut cx.run.reverse_code)
    }

    /// The parse result. The caller receives a new reference.
    fn parsed_root(&mut self, cx: &mut DriverCx<'_>, stop: bool) -> Result<Option<TreeRef>, RuntimeError>;

    /// Release trees the driver holds. Called when the accumulator dies.
    fn release(&mut self, _heap: &mut Heap) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Builds a fresh driver for `CONS_PARSER`.
pub type DriverFactory = Box<dyn Fn() -> Box<dyn ParseDriver>>;

/// Accumulator payload.
#[derive(Debug)]
pub struct Accum {
    pub run: ParseRun,
    pub driver: Option<Box<dyn ParseDriver>>,
    /// Input stream tree, owned.
    pub stream: TreeRef,
    /// Tree produced by the last finished parse.
    pub result: Option<TreeRef>,
}

/// Allocate an accumulator with an empty input stream. The caller owns the
/// returned reference.
pub fn alloc_accum(heap: &mut Heap, driver: Option<Box<dyn ParseDriver>>, revert_on: bool) -> TreeRef {
    let stream = heap.stream(InputStream::new());
    let accum = Accum {
        run: ParseRun::new(revert_on),
        driver,
        stream,
        result: None,
    };
    heap.alloc(Tree::new(ID_ACCUM, Payload::Accum(Box::new(accum))))
}

/// Run the accumulator's driver from `entry`.
fn drive(heap: &mut Heap, accum: &mut Accum, entry: Pcr) -> Result<Pcr, RuntimeError> {
    let Accum {
        run,
        driver,
        stream,
        ..
    } = accum;
    let driver = driver
        .as_mut()
        .ok_or_else(|| RuntimeError::invariant(0, "accumulator has no parse driver"))?;
    let mut cx = DriverCx {
        heap,
        run,
        stream: *stream,
    };
    let pcr = driver.parse_loop(&mut cx, entry)?;
    trace!(target: "sprig::pcr", ?entry, ?pcr, steps = cx.run.steps, "parse loop");
    Ok(pcr)
}

/// Parse input up to the stop target.
pub fn parse_frag(heap: &mut Heap, accum: TreeRef, stop_id: u16, entry: Pcr) -> Result<Pcr, RuntimeError> {
    heap.with_accum(accum, |heap, accum| match entry {
        Pcr::Done => Ok(Pcr::Done),
        Pcr::Start => {
            if accum.run.parse_error.is_some() {
                return Ok(Pcr::Done);
            }
            accum.run.stop_target = stop_id;
            drive(heap, accum, Pcr::Start)
        }
        resume => drive(heap, accum, resume),
    })
}

/// Parse to the end of input and store the parsed root in the
/// accumulator's `result`.
pub fn parse_finish(
    heap: &mut Heap,
    accum: TreeRef,
    revert_on: bool,
    entry: Pcr,
) -> Result<Pcr, RuntimeError> {
    heap.with_accum(accum, |heap, accum| {
        match entry {
            Pcr::Done => return Ok(Pcr::Done),
            Pcr::Start => {
                if accum.run.stop_target == 0 {
                    heap.with_stream(accum.stream, |_, s| {
                        s.set_eof();
                        Ok(())
                    })?;
                    if accum.run.parse_error.is_none() {
                        let pcr = drive(heap, accum, Pcr::Start)?;
                        if pcr != Pcr::Done {
                            return Ok(pcr);
                        }
                    }
                }
            }
            resume => {
                let pcr = drive(heap, accum, resume)?;
                if pcr != Pcr::Done {
                    return Ok(pcr);
                }
            }
        }

        let Accum {
            run,
            driver,
            stream,
            result,
        } = accum;
        let driver = driver
            .as_mut()
            .ok_or_else(|| RuntimeError::invariant(0, "accumulator has no parse driver"))?;
        let stop = run.stop_target > 0;
        let mut cx = DriverCx {
            heap,
            run,
            stream: *stream,
        };
        if !revert_on {
            driver.commit_full(&mut cx)?;
        }
        let tree = driver.parsed_root(&mut cx, stop)?;
        if let Some(t) = tree {
            cx.heap.get_mut(t)?.flags.insert(TreeFlags::PARSED);
        }
        let old = std::mem::replace(result, tree);
        cx.heap.downref_opt(old)?;
        debug!(target: "sprig::pcr", stop, "parse finished");
        Ok(Pcr::Done)
    })
}

/// Back the parse up until it has taken `steps` steps.
pub fn undo_parse_frag(heap: &mut Heap, accum: TreeRef, steps: u64, entry: Pcr) -> Result<Pcr, RuntimeError> {
    heap.with_accum(accum, |heap, accum| {
        match entry {
            Pcr::Done => return Ok(Pcr::Done),
            Pcr::Start => {
                if steps >= accum.run.steps {
                    return Ok(Pcr::Done);
                }
                debug!(target: "sprig::pcr", target = steps, steps = accum.run.steps, "undo parse frag");
                accum.run.num_retry += 1;
                accum.run.target_steps = Some(steps);
                accum.run.trigger_undo = true;
                let pcr = drive(heap, accum, Pcr::Start)?;
                if pcr != Pcr::Done {
                    return Ok(pcr);
                }
            }
            resume => {
                let pcr = drive(heap, accum, resume)?;
                if pcr != Pcr::Done {
                    return Ok(pcr);
                }
            }
        }
        accum.run.trigger_undo = false;
        accum.run.target_steps = None;
        accum.run.num_retry = accum.run.num_retry.saturating_sub(1);
        Ok(Pcr::Done)
    })
}
