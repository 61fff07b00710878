//! Bytecode interpreter
//!
//! Every guest frame runs in its own `interpret` activation. Raises, `break`
//! and `return` travel back up through `Result<_, Unwind>`; rescue handlers
//! are local to the activation that installed them.

use std::collections::HashSet;
use std::rc::Rc;

use super::class::Method;
use super::heap::{EnvData, HeapData, ProcData};
use super::opcodes::{BinOp, CallKind, Irep, OpCode};
use super::symbol::Sym;
use super::value::{ObjPtr, RawValue};
use super::{CallInfo, Engine, FrameKind, Unwind};

enum ExecResult {
    Continue,
    Return(RawValue),
}

/// Rescue handler installed by `PushHandler`.
struct ExceptionHandler {
    rescue_addr: usize,
    /// Operand stack depth when the protected region was entered.
    stack_depth: usize,
}

impl Engine {
    // =========================================================================
    // Frames
    // =========================================================================

    pub(crate) fn push_ci(&mut self, ci: CallInfo) -> Result<(), Unwind> {
        if self.ci.len() >= self.config.max_call_depth {
            let class = self.classes.system_stack_error;
            return Err(self.raise_error(class, "stack level too deep"));
        }
        self.ci.push(ci);
        Ok(())
    }

    /// Run a compiled program as a fresh top-level frame.
    pub(crate) fn run_toplevel(&mut self, irep: &Rc<Irep>) -> Result<RawValue, Unwind> {
        let id = self.next_call_id();
        self.push_ci(CallInfo {
            id,
            kind: FrameKind::Top,
            mid: None,
            self_val: self.top_self,
            args: Vec::new(),
            block: RawValue::nil(),
            env: RawValue::nil(),
            proc_val: RawValue::nil(),
            home_method: id,
        })?;
        let result = self.run_frame(irep, RawValue::nil());
        self.ci.pop();
        match result {
            Err(Unwind::Return { target, value }) if target == id => Ok(value),
            other => other,
        }
    }

    fn invoke_iseq(
        &mut self,
        irep: &Rc<Irep>,
        mid: Sym,
        recv: RawValue,
        args: &[RawValue],
        block: RawValue,
    ) -> Result<RawValue, Unwind> {
        if args.len() != irep.params {
            return Err(self.arity_error(args.len(), irep.params));
        }
        let id = self.next_call_id();
        self.push_ci(CallInfo {
            id,
            kind: FrameKind::Method,
            mid: Some(mid),
            self_val: recv,
            args: args.to_vec(),
            block,
            env: RawValue::nil(),
            proc_val: RawValue::nil(),
            home_method: id,
        })?;
        let result = self.run_frame(irep, RawValue::nil());
        self.ci.pop();
        match result {
            Err(Unwind::Return { target, value }) if target == id => Ok(value),
            other => other,
        }
    }

    /// Call a proc. Block parameters are lenient: missing ones are nil, extra
    /// arguments are dropped and a lone array is spread over several params.
    pub(crate) fn call_block(&mut self, block: RawValue, args: &[RawValue]) -> Result<RawValue, Unwind> {
        let (irep, env, self_val, outer_block, home_method) =
            match block.as_object().and_then(|ptr| self.heap.get(ptr)).map(|obj| &obj.data) {
                Some(HeapData::Proc(p)) => (Rc::clone(&p.irep), p.env, p.self_val, p.outer_block, p.home_method),
                _ => {
                    let name = self.class_name(self.class_of(block)).to_string();
                    return Err(self.type_error(format!("wrong argument type {} (expected Proc)", name)));
                }
            };

        let args = match args {
            [single] if irep.params > 1 => match self.array_elements(*single) {
                Some(elements) => elements.to_vec(),
                None => args.to_vec(),
            },
            _ => args.to_vec(),
        };

        let id = self.next_call_id();
        self.push_ci(CallInfo {
            id,
            kind: FrameKind::Block,
            mid: None,
            self_val,
            args,
            block: outer_block,
            env: RawValue::nil(),
            proc_val: block,
            home_method,
        })?;
        let result = self.run_frame(&irep, env);
        self.ci.pop();
        result
    }

    pub(crate) fn run_frame(&mut self, irep: &Rc<Irep>, parent_env: RawValue) -> Result<RawValue, Unwind> {
        let base = self.stack.len();
        let result = self.interpret(irep, parent_env);
        self.stack.truncate(base);
        result
    }

    fn new_env(&mut self, irep: &Irep, parent: RawValue) -> Result<RawValue, Unwind> {
        let mut slots = vec![RawValue::nil(); irep.nlocals];
        if let Some(ci) = self.ci.last() {
            for (slot, arg) in slots.iter_mut().zip(ci.args.iter().take(irep.params)) {
                *slot = *arg;
            }
        }
        let ptr = self.alloc(ObjPtr::null(), HeapData::Env(EnvData { slots, parent }))?;
        Ok(RawValue::object(ptr))
    }

    fn env_at(&self, env: RawValue, depth: u16) -> RawValue {
        let mut current = env;
        for _ in 0..depth {
            current = match self.env_data(current) {
                Some(data) => data.parent,
                None => return RawValue::nil(),
            };
        }
        current
    }

    fn env_data(&self, env: RawValue) -> Option<&EnvData> {
        match env.as_object().and_then(|ptr| self.heap.get(ptr)).map(|obj| &obj.data) {
            Some(HeapData::Env(data)) => Some(data),
            _ => None,
        }
    }

    fn env_data_mut(&mut self, env: RawValue) -> Option<&mut EnvData> {
        match env.as_object().and_then(|ptr| self.heap.get_mut(ptr)).map(|obj| &mut obj.data) {
            Some(HeapData::Env(data)) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn array_elements(&self, v: RawValue) -> Option<&[RawValue]> {
        match v.as_object().and_then(|ptr| self.heap.get(ptr)).map(|obj| &obj.data) {
            Some(HeapData::Array(elements)) => Some(elements),
            _ => None,
        }
    }

    fn proc_home(&self, proc_val: RawValue) -> u64 {
        match proc_val.as_object().and_then(|ptr| self.heap.get(ptr)).map(|obj| &obj.data) {
            Some(HeapData::Proc(p)) => p.home,
            _ => 0,
        }
    }

    // =========================================================================
    // Interpreter loop
    // =========================================================================

    fn interpret(&mut self, irep: &Rc<Irep>, parent_env: RawValue) -> Result<RawValue, Unwind> {
        let env = self.new_env(irep, parent_env)?;
        let (frame_id, self_val) = match self.ci.last_mut() {
            Some(ci) => {
                ci.env = env;
                (ci.id, ci.self_val)
            }
            None => (0, self.top_self),
        };

        let mut handlers: Vec<ExceptionHandler> = Vec::new();
        let mut pc = 0;
        while let Some(op) = irep.code.get(pc) {
            pc += 1;
            let arena = self.gc.arena.len();
            let step = self.exec_one(op, irep, env, frame_id, self_val, &mut pc, &mut handlers);
            // Anything the instruction kept is on the operand stack by now.
            self.gc.arena.truncate(arena);

            match step {
                Ok(ExecResult::Continue) => {}
                Ok(ExecResult::Return(value)) => return Ok(value),
                Err(Unwind::Raise(exc)) => match handlers.pop() {
                    Some(handler) => {
                        self.stack.truncate(handler.stack_depth);
                        self.exc = exc;
                        pc = handler.rescue_addr;
                    }
                    None => return Err(Unwind::Raise(exc)),
                },
                Err(other) => return Err(other),
            }
        }
        Ok(self.stack.pop().unwrap_or_default())
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_one(
        &mut self,
        op: &OpCode,
        irep: &Rc<Irep>,
        env: RawValue,
        frame_id: u64,
        self_val: RawValue,
        pc: &mut usize,
        handlers: &mut Vec<ExceptionHandler>,
    ) -> Result<ExecResult, Unwind> {
        match op {
            OpCode::Nil => self.stack.push(RawValue::nil()),
            OpCode::True => self.stack.push(RawValue::boolean(true)),
            OpCode::False => self.stack.push(RawValue::boolean(false)),
            OpCode::LoadSelf => self.stack.push(self_val),
            OpCode::LoadInt(n) => self.stack.push(RawValue::integer(*n)),
            OpCode::LoadFloat(f) => self.stack.push(RawValue::float(*f)),
            OpCode::LoadStr(s) => {
                let v = self.new_string(&**s)?;
                self.stack.push(v);
            }
            OpCode::LoadSym(sym) => self.stack.push(RawValue::symbol(*sym)),

            OpCode::GetLocal { depth, index } => {
                let target = self.env_at(env, *depth);
                let v = self
                    .env_data(target)
                    .and_then(|data| data.slots.get(*index as usize))
                    .copied()
                    .unwrap_or_default();
                self.stack.push(v);
            }
            OpCode::SetLocal { depth, index } => {
                let v = self.stack.last().copied().unwrap_or_default();
                let target = self.env_at(env, *depth);
                if let Some(slot) = self
                    .env_data_mut(target)
                    .and_then(|data| data.slots.get_mut(*index as usize))
                {
                    *slot = v;
                }
            }

            OpCode::GetIvar(name) => {
                let v = self_val
                    .as_object()
                    .and_then(|ptr| self.heap.get(ptr))
                    .map(|obj| obj.ivar(*name))
                    .unwrap_or_default();
                self.stack.push(v);
            }
            OpCode::SetIvar(name) => {
                let v = self.stack.last().copied().unwrap_or_default();
                match self_val.as_object().and_then(|ptr| self.heap.get_mut(ptr)) {
                    Some(obj) => obj.set_ivar(*name, v),
                    None => {
                        let class = self.classes.runtime_error;
                        let msg = format!("can't modify frozen {}", self.inspect_raw(self_val));
                        return Err(self.raise_error(class, msg));
                    }
                }
            }

            OpCode::GetConst(name) => match self.constants.get(name) {
                Some(v) => self.stack.push(*v),
                None => {
                    let class = self.classes.name_error;
                    let msg = format!("uninitialized constant {}", self.symbols.name(*name));
                    return Err(self.raise_error(class, msg));
                }
            },
            OpCode::SetConst(name) => {
                let v = self.stack.last().copied().unwrap_or_default();
                self.constants.insert(*name, v);
            }

            OpCode::Pop => {
                self.stack.pop();
            }
            OpCode::Dup => {
                let v = self.stack.last().copied().unwrap_or_default();
                self.stack.push(v);
            }
            OpCode::Array(n) => {
                let start = self.stack.len().saturating_sub(*n);
                let elements = self.stack[start..].to_vec();
                let arr = self.new_array(elements)?;
                self.stack.truncate(start);
                self.stack.push(arr);
            }

            OpCode::Send { mid, argc, block, kind } => {
                let block_val = match block {
                    Some(index) => self.new_block(irep, *index, env, frame_id, self_val)?,
                    None => RawValue::nil(),
                };
                let len = self.stack.len();
                let args_start = len.saturating_sub(*argc);
                let (recv, base) = match kind {
                    CallKind::Call => {
                        let base = args_start.saturating_sub(1);
                        (self.stack.get(base).copied().unwrap_or_default(), base)
                    }
                    CallKind::FCall | CallKind::VCall => (self_val, args_start),
                };
                let args = self.stack[args_start..].to_vec();

                let result = match self.send(recv, *mid, &args, block_val, *kind) {
                    Err(Unwind::Break { target, value }) if block.is_some() && target == frame_id => Ok(value),
                    other => other,
                }?;
                self.stack.truncate(base);
                self.stack.push(result);
            }
            OpCode::Yield(argc) => {
                let block = self.ci.last().map(|ci| ci.block).unwrap_or_default();
                if block.is_nil() {
                    let class = self.classes.local_jump_error;
                    return Err(self.raise_error(class, "no block given (yield)"));
                }
                let start = self.stack.len().saturating_sub(*argc);
                let args = self.stack[start..].to_vec();
                let result = self.call_block(block, &args)?;
                self.stack.truncate(start);
                self.stack.push(result);
            }

            OpCode::Binary(op) => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(self.type_error("operand stack underflow"));
                }
                let (a, b) = (self.stack[len - 2], self.stack[len - 1]);
                let result = self.binary(*op, a, b)?;
                self.stack.truncate(len - 2);
                self.stack.push(result);
            }
            OpCode::Not => {
                let v = self.stack.pop().unwrap_or_default();
                self.stack.push(RawValue::boolean(!v.is_truthy()));
            }
            OpCode::Neg => {
                let v = self.stack.last().copied().unwrap_or_default();
                let result = match (v.as_fixnum(), v.as_float()) {
                    (Some(n), _) => RawValue::integer(-n),
                    (_, Some(f)) => RawValue::float(-f),
                    _ => {
                        let mid = self.symbols.intern("-@");
                        self.send(v, mid, &[], RawValue::nil(), CallKind::Call)?
                    }
                };
                self.stack.pop();
                self.stack.push(result);
            }

            OpCode::Jump(target) => *pc = *target,
            OpCode::JumpIfFalse(target) => {
                let v = self.stack.pop().unwrap_or_default();
                if !v.is_truthy() {
                    *pc = *target;
                }
            }

            OpCode::Def { mid, body } => {
                let Some(body) = irep.children.get(*body).cloned() else {
                    return Err(self.type_error("method body missing"));
                };
                let target = if self_val == self.top_self {
                    self.classes.object
                } else if self.is_class(self_val) {
                    self_val.as_object().unwrap_or(self.classes.object)
                } else {
                    self.class_of(self_val)
                };
                if let Some(data) = self.class_data_mut(target) {
                    data.methods.insert(*mid, Method::Iseq(body));
                }
                self.stack.push(RawValue::symbol(*mid));
            }

            OpCode::Return => {
                let v = self.stack.pop().unwrap_or_default();
                return Ok(ExecResult::Return(v));
            }
            OpCode::ReturnFromBlock => {
                let value = self.stack.pop().unwrap_or_default();
                let target = self.ci.last().map(|ci| ci.home_method).unwrap_or(0);
                return Err(Unwind::Return { target, value });
            }
            OpCode::Break => {
                let value = self.stack.pop().unwrap_or_default();
                let proc_val = self.ci.last().map(|ci| ci.proc_val).unwrap_or_default();
                let target = self.proc_home(proc_val);
                return Err(Unwind::Break { target, value });
            }

            OpCode::PushHandler(addr) => handlers.push(ExceptionHandler {
                rescue_addr: *addr,
                stack_depth: self.stack.len(),
            }),
            OpCode::PopHandler => {
                handlers.pop();
            }
            OpCode::MatchException(n) => {
                let start = self.stack.len().saturating_sub(*n);
                let classes = self.stack[start..].to_vec();
                self.stack.truncate(start);
                let exc = self.exc;
                let matched = if classes.is_empty() {
                    self.is_kind_of(exc, self.classes.standard_error)
                } else {
                    let mut matched = false;
                    for class in classes {
                        let Some(ptr) = class.as_object().filter(|_| self.is_class(class)) else {
                            return Err(self.type_error("class or module required for rescue clause"));
                        };
                        if self.is_kind_of(exc, ptr) {
                            matched = true;
                            break;
                        }
                    }
                    matched
                };
                self.stack.push(RawValue::boolean(matched));
            }
            OpCode::Reraise => {
                let exc = self.exc;
                return Err(Unwind::Raise(exc));
            }
            OpCode::GetException => self.stack.push(self.exc),
            OpCode::ClearException => self.exc = RawValue::nil(),
        }
        Ok(ExecResult::Continue)
    }

    fn new_block(
        &mut self,
        irep: &Rc<Irep>,
        index: usize,
        env: RawValue,
        frame_id: u64,
        self_val: RawValue,
    ) -> Result<RawValue, Unwind> {
        let Some(body) = irep.children.get(index).cloned() else {
            return Err(self.type_error("block body missing"));
        };
        let (outer_block, home_method) = self
            .ci
            .last()
            .map(|ci| (ci.block, ci.home_method))
            .unwrap_or((RawValue::nil(), 0));
        let class = self.classes.proc_;
        let ptr = self.alloc(
            class,
            HeapData::Proc(ProcData {
                irep: body,
                env,
                self_val,
                outer_block,
                home: frame_id,
                home_method,
            }),
        )?;
        Ok(RawValue::object(ptr))
    }

    // =========================================================================
    // Method dispatch
    // =========================================================================

    pub(crate) fn send(
        &mut self,
        recv: RawValue,
        mid: Sym,
        args: &[RawValue],
        block: RawValue,
        kind: CallKind,
    ) -> Result<RawValue, Unwind> {
        match self.lookup_method(recv, mid) {
            Some(method) => self.call_method(method, recv, mid, args, block),
            None => Err(self.method_missing(recv, mid, kind)),
        }
    }

    pub(crate) fn call_method(
        &mut self,
        method: Method,
        recv: RawValue,
        mid: Sym,
        args: &[RawValue],
        block: RawValue,
    ) -> Result<RawValue, Unwind> {
        match method {
            Method::Iseq(irep) => self.invoke_iseq(&irep, mid, recv, args, block),
            Method::Builtin(f) => {
                let id = self.next_call_id();
                self.push_ci(CallInfo {
                    id,
                    kind: FrameKind::Builtin,
                    mid: Some(mid),
                    self_val: recv,
                    args: args.to_vec(),
                    block,
                    env: RawValue::nil(),
                    proc_val: RawValue::nil(),
                    home_method: id,
                })?;
                let result = f(self, recv, args, block);
                self.ci.pop();
                result
            }
            Method::Host(host) => self.invoke_host(&host, recv, mid, args, block),
        }
    }

    fn method_missing(&mut self, recv: RawValue, mid: Sym, kind: CallKind) -> Unwind {
        let name = self.symbols.name(mid).to_string();
        let target = if recv.is_nil() || recv.as_bool().is_some() || recv == self.top_self {
            self.inspect_raw(recv)
        } else if self.is_class(recv) {
            format!("class {}", self.inspect_raw(recv))
        } else {
            format!("an instance of {}", self.class_name(self.class_of(recv)))
        };
        if kind == CallKind::VCall {
            let class = self.classes.name_error;
            self.raise_error(class, format!("undefined local variable or method '{}' for {}", name, target))
        } else {
            let class = self.classes.no_method_error;
            self.raise_error(class, format!("undefined method '{}' for {}", name, target))
        }
    }

    // =========================================================================
    // Operators
    // =========================================================================

    fn binary(&mut self, op: BinOp, a: RawValue, b: RawValue) -> Result<RawValue, Unwind> {
        if let (Some(x), Some(y)) = (a.as_fixnum(), b.as_fixnum()) {
            return self.fixnum_binary(op, x, y);
        }
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return Ok(float_binary(op, x, y));
        }
        match op {
            BinOp::Eq => return Ok(RawValue::boolean(self.values_eq(a, b))),
            BinOp::Ne => return Ok(RawValue::boolean(!self.values_eq(a, b))),
            BinOp::Add => {
                if let (Some(x), Some(y)) = (self.string_raw(a), self.string_raw(b)) {
                    let joined = format!("{}{}", x, y);
                    return self.new_string(joined);
                }
                if let (Some(x), Some(y)) = (self.array_elements(a), self.array_elements(b)) {
                    let joined: Vec<RawValue> = x.iter().chain(y.iter()).copied().collect();
                    return self.new_array(joined);
                }
            }
            _ => {}
        }
        let mid = self.symbols.intern(op.method_name());
        self.send(a, mid, &[b], RawValue::nil(), CallKind::Call)
    }

    fn fixnum_binary(&mut self, op: BinOp, x: i64, y: i64) -> Result<RawValue, Unwind> {
        let v = match op {
            BinOp::Add => RawValue::integer(x + y),
            BinOp::Sub => RawValue::integer(x - y),
            BinOp::Mul => match x.checked_mul(y) {
                Some(n) => RawValue::integer(n),
                None => RawValue::float(x as f64 * y as f64),
            },
            BinOp::Div | BinOp::Mod if y == 0 => {
                let class = self.classes.zero_division_error;
                return Err(self.raise_error(class, "divided by 0"));
            }
            BinOp::Div => {
                let q = x / y;
                if x % y != 0 && ((x < 0) != (y < 0)) {
                    RawValue::integer(q - 1)
                } else {
                    RawValue::integer(q)
                }
            }
            BinOp::Mod => {
                let r = x % y;
                if r != 0 && ((r < 0) != (y < 0)) {
                    RawValue::integer(r + y)
                } else {
                    RawValue::integer(r)
                }
            }
            BinOp::Eq => RawValue::boolean(x == y),
            BinOp::Ne => RawValue::boolean(x != y),
            BinOp::Lt => RawValue::boolean(x < y),
            BinOp::Le => RawValue::boolean(x <= y),
            BinOp::Gt => RawValue::boolean(x > y),
            BinOp::Ge => RawValue::boolean(x >= y),
        };
        Ok(v)
    }

    /// Structural equality used by `==` on built-in types.
    ///
    /// Walks nested arrays with a worklist. A pair of arrays already under
    /// comparison is taken as equal, so self-containing arrays terminate.
    pub(crate) fn values_eq(&self, a: RawValue, b: RawValue) -> bool {
        let mut assumed: HashSet<(RawValue, RawValue)> = HashSet::new();
        let mut pending = vec![(a, b)];
        while let Some((a, b)) = pending.pop() {
            if a == b {
                continue;
            }
            if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
                if x != y {
                    return false;
                }
                continue;
            }
            if let (Some(x), Some(y)) = (self.string_raw(a), self.string_raw(b)) {
                if x != y {
                    return false;
                }
                continue;
            }
            match (self.array_elements(a), self.array_elements(b)) {
                (Some(x), Some(y)) if x.len() == y.len() => {
                    if assumed.insert((a, b)) {
                        pending.extend(x.iter().copied().zip(y.iter().copied()));
                    }
                }
                _ => return false,
            }
        }
        true
    }
}

fn float_binary(op: BinOp, x: f64, y: f64) -> RawValue {
    match op {
        BinOp::Add => RawValue::float(x + y),
        BinOp::Sub => RawValue::float(x - y),
        BinOp::Mul => RawValue::float(x * y),
        BinOp::Div => RawValue::float(x / y),
        BinOp::Mod => RawValue::float(x - y * (x / y).floor()),
        BinOp::Eq => RawValue::boolean(x == y),
        BinOp::Ne => RawValue::boolean(x != y),
        BinOp::Lt => RawValue::boolean(x < y),
        BinOp::Le => RawValue::boolean(x <= y),
        BinOp::Gt => RawValue::boolean(x > y),
        BinOp::Ge => RawValue::boolean(x >= y),
    }
}
