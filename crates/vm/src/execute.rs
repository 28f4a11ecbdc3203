//! Main execution loop and opcode dispatch for the sprig VM.

use std::cmp::Ordering;
use std::io::Write;

use sprig_common::{Instruction, Opcode};
use tracing::{debug, trace};

use crate::error::RuntimeError;
use crate::input::InputStream;
use crate::machine::{Flow, Slot, Vm, FR_RV};
use crate::source::{FdSource, FileSource};

impl Vm<'_> {
    /// Run the current execution until it returns, checking stack balance.
    pub(crate) fn run_block(&mut self) -> Result<(), RuntimeError> {
        let depth = self.stack.len();
        loop {
            let at = self.exec.ip;
            let (instr, len) =
                Instruction::decode(&self.exec.code, at).map_err(|e| RuntimeError::from_decode(e, at))?;
            self.at = at;
            self.exec.ip = at + len;

            if self.exec.reverse && !instr.opcode.is_reverse() {
                return Err(RuntimeError::IllegalInReverse {
                    at,
                    op: instr.opcode.mnemonic(),
                });
            }
            trace!(target: "sprig::vm", op = instr.opcode.mnemonic(), at, depth = self.stack.len(), "dispatch");

            match self.dispatch(&instr)? {
                Flow::Continue => {}
                Flow::Return => break,
                Flow::Exit => return Ok(()),
            }
        }

        if self.stack.len() != depth {
            return Err(RuntimeError::StackImbalance {
                expected: depth,
                found: self.stack.len(),
            });
        }
        Ok(())
    }

    fn dispatch(&mut self, instr: &Instruction) -> Result<Flow, RuntimeError> {
        match instr.opcode {
            // Loads
            Opcode::LoadNil => self.push(Slot::Nil)?,
            Opcode::LoadTrue => self.push_bool(true)?,
            Opcode::LoadFalse => self.push_bool(false)?,
            Opcode::LoadInt => self.push_int(instr.word(0) as i64)?,
            Opcode::LoadStr => self.exec_load_str(instr)?,
            Opcode::LoadWord => self.push(Slot::Word(instr.word(0)))?,
            Opcode::LoadTree => self.push_tree(crate::tree::TreeRef::from_word(instr.word(0)))?,
            Opcode::LoadGlobalR | Opcode::LoadGlobalWc | Opcode::LoadGlobalBkt => {
                self.push_shared(Some(self.global))?
            }
            Opcode::LoadGlobalWv => {
                self.push_shared(Some(self.global))?;
                self.rcode_start(Opcode::LoadGlobalBkt, &[])?;
            }
            Opcode::LoadContextR | Opcode::LoadContextWc | Opcode::LoadContextBkt => self.exec_load_context()?,
            Opcode::LoadContextWv => {
                self.exec_load_context()?;
                self.rcode_start(Opcode::LoadContextBkt, &[])?;
            }
            Opcode::LoadAccumR | Opcode::LoadAccumWc => self.push_shared(self.exec.accum)?,
            Opcode::LoadAccumWv => {
                self.push_shared(self.exec.accum)?;
                let word = crate::tree::TreeRef::to_word(self.exec.accum);
                self.rcode_start(Opcode::LoadAccumBkt, &[word])?;
            }
            Opcode::LoadAccumBkt => self.push_shared(crate::tree::TreeRef::from_word(instr.word(0)))?,
            Opcode::LoadArgv => self.exec_load_argv(instr)?,
            Opcode::GetStdin => self.exec_get_stdin()?,
            Opcode::OpenFile => self.exec_open_file()?,

            // Stack
            Opcode::Pop => self.pop_n(1)?,
            Opcode::PopNWords => self.pop_n(instr.half(0) as usize)?,
            Opcode::DupTop => self.exec_dup(0)?,
            Opcode::DupTopOff => self.exec_dup(instr.half(0) as usize)?,

            // Jumps
            Opcode::Jmp => self.jump(instr.signed_half(0))?,
            Opcode::JmpFalse => self.exec_cond_jump(instr, false)?,
            Opcode::JmpTrue => self.exec_cond_jump(instr, true)?,

            // Tests
            Opcode::TstEql => self.exec_compare(|o| o == Ordering::Equal)?,
            Opcode::TstNotEql => self.exec_compare(|o| o != Ordering::Equal)?,
            Opcode::TstLess => self.exec_compare(|o| o == Ordering::Less)?,
            Opcode::TstLessEql => self.exec_compare(|o| o != Ordering::Greater)?,
            Opcode::TstGrtr => self.exec_compare(|o| o == Ordering::Greater)?,
            Opcode::TstGrtrEql => self.exec_compare(|o| o != Ordering::Less)?,
            Opcode::TstLogicalAnd => self.exec_logical(|a, b| a && b)?,
            Opcode::TstLogicalOr => self.exec_logical(|a, b| a || b)?,
            Opcode::Not => self.exec_not()?,

            // Arithmetic
            Opcode::AddInt => self.exec_arith(|a, b| Some(a.wrapping_add(b)))?,
            Opcode::SubInt => self.exec_arith(|a, b| Some(a.wrapping_sub(b)))?,
            Opcode::MultInt => self.exec_arith(|a, b| Some(a.wrapping_mul(b)))?,
            Opcode::DivInt => self.exec_arith(|a, b| a.checked_div(b).or((b == -1).then(|| a.wrapping_neg())))?,

            // Strings and output
            Opcode::ConcatStr => self.exec_concat()?,
            Opcode::StrLength => {
                let s = self.pop_str()?;
                self.push_int(s.len() as i64)?
            }
            Opcode::StrAtoi => self.exec_atoi()?,
            Opcode::IntToStr => {
                let v = self.pop_int()?;
                self.push_str(v.to_string())?
            }
            Opcode::TreeToStr => {
                let t = self.pop_tree()?;
                let text = self.heap.text(t)?;
                self.heap.downref_opt(t)?;
                self.push_str(text)?
            }
            Opcode::StrUord8 => {
                let s = self.pop_str()?;
                self.push_int(s.first().copied().unwrap_or(0) as i64)?
            }
            Opcode::StrUord16 => {
                let s = self.pop_str()?;
                let hi = s.first().copied().unwrap_or(0) as i64;
                let lo = s.get(1).copied().unwrap_or(0) as i64;
                self.push_int((hi << 8) | lo)?
            }
            Opcode::ToUpper => {
                let s = self.pop_str()?;
                self.push_str(s.to_ascii_uppercase())?
            }
            Opcode::ToLower => {
                let s = self.pop_str()?;
                self.push_str(s.to_ascii_lowercase())?
            }
            Opcode::Sprintf => self.exec_sprintf()?,
            Opcode::Print => self.exec_print(instr)?,

            // Locals
            Opcode::InitLocals => self.exec_init_locals(instr)?,
            Opcode::PopLocals => self.exec_pop_locals(instr)?,
            Opcode::GetLocalR => {
                let t = self.local_tree(instr.signed_half(0))?;
                self.push_shared(t)?
            }
            Opcode::GetLocalWc => self.exec_get_local_wc(instr)?,
            Opcode::SetLocalWc => {
                let value = self.pop_tree()?;
                self.set_local(instr.signed_half(0), Slot::from_tree(value))?
            }
            Opcode::SaveRet => {
                let value = self.pop_tree()?;
                self.set_local(FR_RV, Slot::from_tree(value))?
            }
            Opcode::GetLocalRefR => self.exec_get_local_ref(instr, false)?,
            Opcode::GetLocalRefWc => self.exec_get_local_ref(instr, true)?,
            Opcode::SetLocalRefWc => self.exec_set_local_ref(instr)?,

            // References
            Opcode::RefFromLocal => self.exec_ref_from_local(instr)?,
            Opcode::RefFromRef => self.exec_ref_from_ref(instr)?,
            Opcode::RefFromQualRef => self.exec_ref_from_qual_ref(instr)?,
            Opcode::TriterRefFromCur => self.exec_triter_ref_from_cur(instr)?,
            Opcode::UiterRefFromCur => self.exec_uiter_ref_from_cur(instr)?,

            // Fields
            Opcode::GetFieldR => self.exec_get_field_r(instr)?,
            Opcode::GetFieldWc | Opcode::GetFieldBkt => self.exec_get_field_wc(instr)?,
            Opcode::GetFieldWv => {
                self.exec_get_field_wc(instr)?;
                self.rcode_extend(Opcode::GetFieldBkt, &[instr.half(0) as u64])?;
            }
            Opcode::SetFieldWc => self.exec_set_field(instr, false)?,
            Opcode::SetFieldWv => self.exec_set_field(instr, true)?,
            Opcode::SetFieldBkt => self.exec_set_field_bkt(instr)?,
            Opcode::SetFieldLeaveWc => self.exec_set_field_leave(instr)?,

            // Pointers
            Opcode::TreeNew => {
                let t = self.pop_tree()?;
                let ptr = self.heap.pointer(t);
                self.push_tree(Some(ptr))?
            }
            Opcode::PtrDerefR => self.exec_ptr_deref_r()?,
            Opcode::PtrDerefWc => self.exec_ptr_deref_wc()?,
            Opcode::PtrDerefWv => self.exec_ptr_deref_wv()?,
            Opcode::PtrDerefBkt => self.exec_ptr_deref_bkt(instr)?,

            // Token data
            Opcode::GetTokenDataR => self.exec_get_token_data()?,
            Opcode::SetTokenDataWc => self.exec_set_token_data(false)?,
            Opcode::SetTokenDataWv => self.exec_set_token_data(true)?,
            Opcode::SetTokenDataBkt => self.exec_set_token_data_bkt(instr)?,
            Opcode::GetTokenPosR => self.exec_get_token_pos()?,
            Opcode::GetMatchLengthR => self.exec_get_match(true)?,
            Opcode::GetMatchTextR => self.exec_get_match(false)?,

            // Construction
            Opcode::ConstructTerm => self.exec_construct_term(instr)?,
            Opcode::MakeToken => self.exec_make_token(instr)?,
            Opcode::MakeTree => self.exec_make_tree(instr)?,
            Opcode::ConsList => {
                let t = self.heap.list(instr.half(0));
                self.push_tree(Some(t))?
            }
            Opcode::ConsMap => {
                let t = self.heap.map(instr.half(0));
                self.push_tree(Some(t))?
            }
            Opcode::ConsParser => self.exec_cons_parser(instr)?,
            Opcode::TreeSearch => self.exec_tree_search(instr)?,

            // Lists
            Opcode::ListLength => self.exec_list_length()?,
            Opcode::ListAppendWv => self.exec_list_append(true)?,
            Opcode::ListAppendWc => self.exec_list_append(false)?,
            Opcode::ListAppendBkt => self.exec_list_append_bkt()?,
            Opcode::ListRemoveEndWv => self.exec_list_remove_end(true)?,
            Opcode::ListRemoveEndWc => self.exec_list_remove_end(false)?,
            Opcode::ListRemoveEndBkt => self.exec_list_remove_end_bkt(instr)?,
            Opcode::GetListMemR => self.exec_get_list_mem_r(instr)?,
            Opcode::GetListMemWc | Opcode::GetListMemBkt => self.exec_get_list_mem_wc(instr)?,
            Opcode::GetListMemWv => {
                self.exec_get_list_mem_wc(instr)?;
                self.rcode_extend(Opcode::GetListMemBkt, &[instr.half(0) as u64])?;
            }
            Opcode::SetListMemWc => self.exec_set_list_mem(instr, false)?,
            Opcode::SetListMemWv => self.exec_set_list_mem(instr, true)?,
            Opcode::SetListMemBkt => self.exec_set_list_mem_bkt(instr)?,

            // Maps
            Opcode::MapLength => self.exec_map_length()?,
            Opcode::MapFind => self.exec_map_find()?,
            Opcode::MapInsertWv => self.exec_map_insert(true)?,
            Opcode::MapInsertWc => self.exec_map_insert(false)?,
            Opcode::MapInsertBkt => self.exec_map_insert_bkt(instr)?,
            Opcode::MapStoreWv => self.exec_map_store(true)?,
            Opcode::MapStoreWc => self.exec_map_store(false)?,
            Opcode::MapStoreBkt => self.exec_map_store_bkt(instr)?,
            Opcode::MapRemoveWv => self.exec_map_remove(true)?,
            Opcode::MapRemoveWc => self.exec_map_remove(false)?,
            Opcode::MapRemoveBkt => self.exec_map_remove_bkt(instr)?,

            // Tree iterators
            Opcode::TriterFromRef => self.exec_triter_from_ref(instr)?,
            Opcode::TriterAdvance => self.exec_triter_advance(instr, false)?,
            Opcode::TriterNextChild => self.exec_triter_advance(instr, true)?,
            Opcode::TriterGetCurR => self.exec_triter_get_cur(instr, false)?,
            Opcode::TriterGetCurWc => self.exec_triter_get_cur(instr, true)?,
            Opcode::TriterSetCurWc => self.exec_triter_set_cur(instr)?,
            Opcode::TriterDestroy => self.exec_triter_destroy(instr)?,

            // User iterators
            Opcode::UiterCreateWv => self.exec_uiter_create(instr, true)?,
            Opcode::UiterCreateWc => self.exec_uiter_create(instr, false)?,
            Opcode::UiterAdvance => self.exec_uiter_advance(instr)?,
            Opcode::UiterGetCurR => self.exec_uiter_get_cur(instr, false)?,
            Opcode::UiterGetCurWc => self.exec_uiter_get_cur(instr, true)?,
            Opcode::UiterSetCurWc => self.exec_uiter_set_cur(instr)?,
            Opcode::UiterDestroy => self.exec_uiter_destroy(instr)?,
            Opcode::Yield => self.exec_yield()?,

            // Calls
            Opcode::CallWv => self.exec_call(instr, true)?,
            Opcode::CallWc => self.exec_call(instr, false)?,
            Opcode::Ret => self.exec_ret(instr)?,

            // Reductions
            Opcode::InitRhsEl => self.exec_init_rhs_el(instr)?,
            Opcode::InitLhsEl => self.exec_init_lhs_el(instr)?,
            Opcode::StoreLhsEl => self.exec_store_lhs_el(instr)?,
            Opcode::RestoreLhs => self.exec_restore_lhs(instr)?,
            Opcode::Reject => self.exec_reject()?,

            // Streams
            Opcode::ConsAccumStream => {
                let t = self.heap.stream(InputStream::new());
                self.push_tree(Some(t))?
            }
            Opcode::GetAccumStream => self.exec_get_accum_stream()?,
            Opcode::GetAccumCtxR => self.exec_get_accum_ctx()?,
            Opcode::SetAccumCtxWc => self.exec_set_accum_ctx()?,
            Opcode::StreamAppendWc => self.exec_stream_append(false)?,
            Opcode::StreamAppendWv => self.exec_stream_append(true)?,
            Opcode::StreamAppendBkt => self.exec_stream_append_bkt(instr)?,
            Opcode::StreamPullWc => self.exec_stream_pull(false)?,
            Opcode::StreamPullWv => self.exec_stream_pull(true)?,
            Opcode::StreamPullBkt => self.exec_stream_pull_bkt(instr)?,
            Opcode::StreamPushWc => self.exec_stream_push(false, false)?,
            Opcode::StreamPushWv => self.exec_stream_push(false, true)?,
            Opcode::StreamPushIgnoreWc => self.exec_stream_push(true, false)?,
            Opcode::StreamPushIgnoreWv => self.exec_stream_push(true, true)?,
            Opcode::StreamPushBkt => self.exec_stream_push_bkt(instr)?,

            // Parse continuations
            Opcode::ParseSaveSteps => self.exec_parse_save_steps()?,
            Opcode::ParseLoadStart => self.push(Slot::Word(crate::pcr::Pcr::Start.to_word()))?,
            Opcode::PcrCall => return self.exec_pcr_call(),
            Opcode::PcrRet => return Ok(Flow::Return),
            Opcode::PcrEndDeck => {
                self.exec_end_deck()?;
                return Ok(Flow::Return);
            }
            Opcode::ParseFragWc => self.exec_parse_frag(instr, false)?,
            Opcode::ParseFragWv => self.exec_parse_frag(instr, true)?,
            Opcode::ParseFragBkt => self.exec_parse_undo(instr)?,
            Opcode::ParseFragWc3 => return self.exec_parse_frag3(false),
            Opcode::ParseFragWv3 => return self.exec_parse_frag3(true),
            Opcode::ParseFragBkt3 => self.exec_parse_frag_bkt3()?,
            Opcode::ParseFinishWc => self.exec_parse_finish(instr, false)?,
            Opcode::ParseFinishWv => self.exec_parse_finish(instr, true)?,
            Opcode::ParseFinishBkt => self.exec_parse_undo(instr)?,
            Opcode::ParseFinishWc3 => return self.exec_parse_finish3(false),
            Opcode::ParseFinishWv3 => return self.exec_parse_finish3(true),
            Opcode::ParseFinishBkt3 => self.exec_parse_finish_bkt3()?,

            // Program control
            Opcode::Exit => {
                self.exit_status = self.pop_int()?;
                self.induce_exit = true;
                debug!(target: "sprig::vm", status = self.exit_status, at = self.at, "exit induced");
                return Ok(Flow::Exit);
            }
            Opcode::Error => self.push_shared(self.last_parse_error)?,
            Opcode::Stop => return Ok(Flow::Return),
            Opcode::Halt => return Err(RuntimeError::Halt { at: self.at }),
        }
        Ok(Flow::Continue)
    }

    // ---- loads

    fn exec_load_str(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let id = instr.half(0);
        let text = self
            .program
            .literal(id)
            .ok_or(RuntimeError::UnknownLiteral { at: self.at, id })?;
        self.push_str(text)
    }

    fn exec_load_context(&mut self) -> Result<(), RuntimeError> {
        let context = match self.exec.accum {
            Some(accum) => self.heap.with_accum(accum, |_, a| Ok(a.run.context))?,
            None => None,
        };
        self.push_shared(context)
    }

    /// Store the program arguments as a list of strings in a global field.
    fn exec_load_argv(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let list = self.heap.list(sprig_common::lang_el::ID_STR);
        let args: Vec<_> = self
            .options
            .argv
            .iter()
            .map(|a| self.heap.string(a.as_bytes()))
            .collect();
        if let Some(items) = self.heap.list_items_mut(list)? {
            items.extend(args);
        }
        let old = self.heap.set_attr(self.global, instr.half(0) as usize, Some(list))?;
        self.heap.downref_opt(old)
    }

    fn exec_get_stdin(&mut self) -> Result<(), RuntimeError> {
        let stream = match self.stdin {
            Some(s) => s,
            None => {
                let s = self.heap.stream(InputStream::with_source(Box::new(FdSource::stdin())));
                self.stdin = Some(s);
                s
            }
        };
        self.push_shared(Some(stream))
    }

    /// Only read mode is supported; anything else, or a failed open, is nil.
    fn exec_open_file(&mut self) -> Result<(), RuntimeError> {
        let mode = self.pop_str()?;
        let name = self.pop_str()?;
        let name = String::from_utf8_lossy(&name).into_owned();
        if mode.as_slice() != b"r" {
            debug!(target: "sprig::vm", file = %name, "unsupported open mode");
            return self.push(Slot::Nil);
        }
        match FileSource::open(&name) {
            Ok(source) => {
                let s = self.heap.stream(InputStream::with_source(Box::new(source)));
                self.push_tree(Some(s))
            }
            Err(err) => {
                debug!(target: "sprig::vm", file = %name, %err, "open failed");
                self.push(Slot::Nil)
            }
        }
    }

    // ---- stack

    fn exec_dup(&mut self, offset: usize) -> Result<(), RuntimeError> {
        let slot = self
            .stack
            .len()
            .checked_sub(offset + 1)
            .and_then(|i| self.stack.get(i))
            .cloned()
            .ok_or(RuntimeError::StackUnderflow { at: self.at })?;
        match slot {
            Slot::Tree(t) => self.push_shared(Some(t)),
            Slot::Nil | Slot::Word(_) => self.push(slot),
            _ => Err(self.mismatch("tree or word")),
        }
    }

    // ---- jumps

    fn jump(&mut self, distance: i16) -> Result<(), RuntimeError> {
        let target = self.exec.ip as isize + distance as isize;
        if target < 0 || target as usize > self.exec.code.len() {
            return Err(RuntimeError::invariant(self.at, format!("jump to {target}")));
        }
        self.exec.ip = target as usize;
        Ok(())
    }

    fn exec_cond_jump(&mut self, instr: &Instruction, when: bool) -> Result<(), RuntimeError> {
        let t = self.pop_tree()?;
        let value = self.test(t);
        self.heap.downref_opt(t)?;
        if value == when {
            self.jump(instr.signed_half(0))?;
        }
        Ok(())
    }

    // ---- tests

    fn exec_compare(&mut self, pred: impl Fn(Ordering) -> bool) -> Result<(), RuntimeError> {
        let o2 = self.pop_tree()?;
        let o1 = self.pop_tree()?;
        let result = pred(self.heap.cmp_tree(o1, o2));
        self.heap.downref_opt(o1)?;
        self.heap.downref_opt(o2)?;
        self.push_bool(result)
    }

    fn exec_logical(&mut self, op: impl Fn(bool, bool) -> bool) -> Result<(), RuntimeError> {
        let o2 = self.pop_tree()?;
        let o1 = self.pop_tree()?;
        let result = op(self.test(o1), self.test(o2));
        self.heap.downref_opt(o1)?;
        self.heap.downref_opt(o2)?;
        self.push_bool(result)
    }

    fn exec_not(&mut self) -> Result<(), RuntimeError> {
        let t = self.pop_tree()?;
        let result = !self.test(t);
        self.heap.downref_opt(t)?;
        self.push_bool(result)
    }

    // ---- arithmetic

    /// Pop two Ints and push `op(first, second)`. `None` means a zero divisor.
    fn exec_arith(&mut self, op: impl Fn(i64, i64) -> Option<i64>) -> Result<(), RuntimeError> {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        let result = op(a, b).ok_or(RuntimeError::DivisionByZero { at: self.at })?;
        self.push_int(result)
    }

    // ---- strings

    fn exec_concat(&mut self) -> Result<(), RuntimeError> {
        let s2 = self.pop_str()?;
        let mut s1 = self.pop_str()?;
        s1.extend_from_slice(&s2);
        self.push_str(s1)
    }

    /// Leading optional sign and digits; anything unparsable is zero.
    fn exec_atoi(&mut self) -> Result<(), RuntimeError> {
        let s = self.pop_str()?;
        let text = String::from_utf8_lossy(&s);
        let text = text.trim();
        let end = text
            .char_indices()
            .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
            .map_or(text.len(), |(i, _)| i);
        self.push_int(text[..end].parse().unwrap_or(0))
    }

    fn exec_sprintf(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop_int()?;
        let format = self.pop_str()?;
        let mut out = Vec::with_capacity(format.len() + 8);
        let mut bytes = format.iter().copied();
        while let Some(b) = bytes.next() {
            if b != b'%' {
                out.push(b);
                continue;
            }
            match bytes.next() {
                Some(b'd') | Some(b's') => out.extend_from_slice(value.to_string().as_bytes()),
                Some(b'x') => out.extend_from_slice(format!("{value:x}").as_bytes()),
                Some(b'%') => out.push(b'%'),
                Some(other) => out.extend_from_slice(&[b'%', other]),
                None => out.push(b'%'),
            }
        }
        self.push_str(out)
    }

    /// Write the text of the top `n` trees in the order they were pushed.
    fn exec_print(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let n = instr.byte(0) as usize;
        let mut trees = Vec::with_capacity(n);
        for _ in 0..n {
            trees.push(self.pop_tree()?);
        }
        for t in trees.into_iter().rev() {
            let text = self.heap.text(t)?;
            self.heap.downref_opt(t)?;
            self.output.write_all(&text)?;
        }
        self.output.flush()?;
        Ok(())
    }

    // ---- locals

    fn exec_init_locals(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        self.exec.frame_ptr = self.stack.len();
        for _ in 0..instr.half(0) {
            self.push(Slot::Nil)?;
        }
        Ok(())
    }

    /// Release the frame's tree locals, then pop the locals.
    fn release_frame(&mut self, frame_id: u16, size: usize) -> Result<(), RuntimeError> {
        let frame = self.frame(frame_id)?;
        for &offset in &frame.trees {
            let idx = self.local(offset)?;
            let old = std::mem::take(&mut self.stack[idx]);
            self.release(old)?;
        }
        self.pop_n(size)
    }

    fn exec_pop_locals(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        self.release_frame(instr.half(0), instr.half(1) as usize)
    }

    fn exec_get_local_wc(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let idx = self.local(instr.signed_half(0))?;
        let tree = match self.stack[idx] {
            Slot::Tree(t) => {
                let unique = self.heap.split(t)?;
                self.stack[idx] = Slot::Tree(unique);
                Some(unique)
            }
            Slot::Nil => None,
            _ => return Err(self.mismatch("tree local")),
        };
        self.push_shared(tree)
    }

    // ---- calls

    fn exec_call(&mut self, instr: &Instruction, revert: bool) -> Result<(), RuntimeError> {
        let func = self.function(instr.half(0))?;
        let frame = self.frame(func.frame_id)?;
        trace!(target: "sprig::vm", func = %func.name, at = self.at, "call");
        self.push(Slot::Nil)?;
        self.push(Slot::Ip(self.exec.ip))?;
        self.push(Slot::Word(self.exec.frame_ptr as u64))?;
        self.push(Slot::Word(self.exec.frame_id as u64))?;
        self.exec.frame_id = func.frame_id;
        self.exec.ip = if revert { frame.code_wv } else { frame.code_wc };
        Ok(())
    }

    fn exec_ret(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let func = self.function(instr.half(0))?;
        self.release_frame(func.frame_id, func.frame_size as usize)?;
        if self.stack.len() != self.exec.frame_ptr {
            return Err(RuntimeError::invariant(
                self.at,
                format!("return with {} stray slots", self.stack.len() as isize - self.exec.frame_ptr as isize),
            ));
        }

        let frame_id = self.pop_word()?;
        let frame_ptr = self.pop_word()?;
        let ip = match self.pop()? {
            Slot::Ip(ip) => ip,
            _ => return Err(self.mismatch("return address")),
        };
        let retval = self.pop_tree()?;

        self.exec.frame_id = frame_id as u16;
        self.exec.frame_ptr = frame_ptr as usize;
        self.exec.ip = ip;
        self.pop_n(func.arg_size as usize)?;
        trace!(target: "sprig::vm", func = %func.name, "return");
        self.push_tree(retval)
    }
}
