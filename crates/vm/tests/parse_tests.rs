//! Parse continuations driven by a scripted parser.
//!
//! `Reducer` takes one step per call and asks for a reduction action after
//! each. It backs up by replaying reverse code when the VM triggers an
//! undo, so these tests see the whole suspend/resume protocol without a
//! real grammar.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use sprig_asm::assemble;
use sprig_common::Program;
use sprig_vm::pcr::{self, DriverFactory};
use sprig_vm::{Action, DriverCx, ParseDriver, Pcr, RuntimeError, TreeRef, Vm};

#[derive(Debug)]
struct Reducer {
    limit: u64,
    frame_id: u16,
}

impl ParseDriver for Reducer {
    fn parse_loop(&mut self, cx: &mut DriverCx<'_>, entry: Pcr) -> Result<Pcr, RuntimeError> {
        if cx.run.trigger_undo {
            // Each reduction left its undo group above its deck group.
            if entry == Pcr::RevReduction && cx.run.schedule_revert() {
                return Ok(Pcr::RevReduction2);
            }
            let target = cx.run.target_steps.unwrap_or(0);
            if cx.run.steps > target && cx.run.schedule_revert() {
                cx.run.steps -= 1;
                return Ok(Pcr::RevReduction);
            }
            return Ok(Pcr::Done);
        }
        if entry == Pcr::Reduction {
            cx.run.make_reverse_code()?;
        }
        if cx.run.steps < self.limit {
            cx.run.steps += 1;
            cx.run.action = Action::Frame {
                frame_id: self.frame_id,
            };
            return Ok(Pcr::Reduction);
        }
        Ok(Pcr::Done)
    }

    fn parsed_root(&mut self, cx: &mut DriverCx<'_>, _stop: bool) -> Result<Option<TreeRef>, RuntimeError> {
        Ok(Some(cx.heap.int(cx.run.steps as i64)))
    }
}

fn reducer(limit: u64) -> DriverFactory {
    Box::new(move || Box::new(Reducer { limit, frame_id: 0 }) as Box<dyn ParseDriver>)
}

/// Frame 0 appends 1 to the list in global field 0, with undo logging.
const APPEND_ACTION: &str = "\
.globals 1
act:
    LOAD_INT 1
    LOAD_GLOBAL_WV
    GET_FIELD_WV 0
    LIST_APPEND_WV
    POP
    PCR_RET
.frame 0 act wv=@act
";

const LIST_SETUP: &str = "\
    CONS_LIST 9
    LOAD_GLOBAL_WC
    SET_FIELD_WC 0
";

fn program(text: &str) -> Program {
    assemble(text).unwrap_or_else(|e| panic!("{e}"))
}

fn list_len(vm: &Vm<'_>) -> usize {
    let list = vm.heap().attr(vm.global(), 0).unwrap().unwrap();
    vm.heap().list_items(list).unwrap().unwrap().len()
}

#[test]
fn host_drives_frag_undo_and_finish() {
    let program = program(&format!("{APPEND_ACTION}.root\n{LIST_SETUP}    STOP\n"));
    let mut vm = Vm::new(&program);
    vm.run().unwrap();
    let base = vm.heap().live_count();

    let driver = Box::new(Reducer { limit: 3, frame_id: 0 });
    let accum = pcr::alloc_accum(vm.heap_mut(), Some(driver), true);
    vm.parse_frag(accum, 0).unwrap();
    assert_eq!(list_len(&vm), 3);

    vm.undo_parse_frag(accum, 1).unwrap();
    assert_eq!(list_len(&vm), 1);
    let steps = vm.heap_mut().with_accum(accum, |_, a| Ok(a.run.steps)).unwrap();
    assert_eq!(steps, 1);

    // Finishing parses the rest of the way again.
    let result = vm.parse_finish(accum, false).unwrap().unwrap();
    assert_eq!(vm.heap().int_value(result).unwrap(), Some(3));
    assert_eq!(list_len(&vm), 3);
    assert!(vm.stack().is_empty());

    vm.heap_mut().downref(result).unwrap();
    vm.heap_mut().downref(accum).unwrap();
    assert_eq!(vm.heap().live_count(), base + 3);
}

#[test]
fn undo_past_nothing_is_a_no_op() {
    let program = program(&format!("{APPEND_ACTION}.root\n{LIST_SETUP}    STOP\n"));
    let mut vm = Vm::new(&program);
    vm.run().unwrap();
    let accum = pcr::alloc_accum(vm.heap_mut(), Some(Box::new(Reducer { limit: 2, frame_id: 0 })), true);
    vm.parse_frag(accum, 0).unwrap();
    vm.undo_parse_frag(accum, 5).unwrap();
    assert_eq!(list_len(&vm), 2);
    vm.heap_mut().downref(accum).unwrap();
}

#[test]
fn bytecode_parse_finish() {
    let program = program(&format!(
        "{APPEND_ACTION}\
.root
{LIST_SETUP}\
    CONS_PARSER 0
    PARSE_SAVE_STEPS
    PARSE_LOAD_START
    PARSE_FINISH_WC 0
    PCR_CALL
    PARSE_FINISH_WC3
    PRINT 1
    LOAD_GLOBAL_R
    GET_FIELD_R 0
    LIST_LENGTH
    PRINT 1
    STOP
"
    ));
    let out = Rc::new(RefCell::new(Vec::new()));
    let mut vm = Vm::new(&program);
    vm.set_output(Box::new(SharedBuf(out.clone())));
    vm.register_parser(0, reducer(2));
    assert_eq!(vm.run(), Ok(0));
    assert_eq!(String::from_utf8_lossy(&out.borrow()), "22");
    // global, true, false, the list and its two items
    assert_eq!(vm.heap().live_count(), 6);
}

#[test]
fn nested_parse_is_undone_by_outer_revert() {
    let program = program(&format!(
        "{APPEND_ACTION}\
outer:
    CONS_PARSER 0
    PARSE_SAVE_STEPS
    PARSE_LOAD_START
    PARSE_FRAG_WV 0
    PCR_CALL
    PARSE_FRAG_WV3
    PCR_RET
.frame 1 outer wv=@outer
.root
{LIST_SETUP}\
    STOP
"
    ));
    let mut vm = Vm::new(&program);
    vm.register_parser(0, reducer(2));
    vm.run().unwrap();
    let base = vm.heap().live_count();

    let outer = pcr::alloc_accum(vm.heap_mut(), None, true);
    vm.execute_frame(outer, 1, true).unwrap();
    assert_eq!(list_len(&vm), 2);
    assert!(vm.stack().is_empty());

    assert!(vm.make_reverse_code(outer).unwrap());
    assert!(vm.revert_group(outer).unwrap());
    assert_eq!(list_len(&vm), 0);
    assert!(vm.stack().is_empty());

    vm.heap_mut().downref(outer).unwrap();
    assert_eq!(vm.heap().live_count(), base);
}

#[test]
fn exit_in_reduction_action_unwinds_the_parse() {
    let program = program(
        "\
quit:
    LOAD_INT 4
    EXIT
    PCR_RET
.frame 0 quit wv=@quit
.root
    CONS_PARSER 0
    PARSE_SAVE_STEPS
    PARSE_LOAD_START
    PARSE_FRAG_WC 0
    PCR_CALL
    PARSE_FRAG_WC3
    STOP
",
    );
    let mut vm = Vm::new(&program);
    vm.set_output(Box::new(io::sink()));
    vm.register_parser(0, reducer(2));
    assert_eq!(vm.run(), Ok(4));
    assert!(vm.exit_induced());
    assert!(vm.stack().is_empty());
    assert_eq!(vm.heap().live_count(), 3);
}

#[test]
fn parse_finish_of_an_empty_parse() {
    let program = program("STOP\n");
    let mut vm = Vm::new(&program);
    let accum = pcr::alloc_accum(vm.heap_mut(), Some(Box::new(Reducer { limit: 0, frame_id: 0 })), false);
    let result = vm.parse_finish(accum, false).unwrap().unwrap();
    assert_eq!(vm.heap().int_value(result).unwrap(), Some(0));
    vm.heap_mut().downref(result).unwrap();
    vm.heap_mut().downref(accum).unwrap();
    assert_eq!(vm.heap().live_count(), 3);
}

#[test]
fn parse_without_driver_is_internal() {
    let program = program("STOP\n");
    let mut vm = Vm::new(&program);
    let accum = pcr::alloc_accum(vm.heap_mut(), None, false);
    let err = vm.parse_frag(accum, 0).unwrap_err();
    assert!(err.is_internal());
    vm.heap_mut().downref(accum).unwrap();
}

struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
