//! Built-in methods of the core classes.

use super::heap::{ExceptionData, HeapData};
use super::value::RawValue;
use super::{Engine, Unwind, float_to_s};

/// Largest length `[]=` will grow an array to.
pub const ARRAY_MAX_LEN: usize = 1 << 24;

pub fn install(engine: &mut Engine) {
    let c = engine.classes;

    // Kernel
    engine.define_builtin(c.object, "puts", kernel_puts);
    engine.define_builtin(c.object, "p", kernel_p);
    engine.define_builtin(c.object, "raise", kernel_raise);
    engine.define_builtin(c.object, "proc", kernel_proc);
    engine.define_builtin(c.object, "block_given?", kernel_block_given);
    engine.define_builtin(c.object, "nil?", kernel_nil_p);
    engine.define_builtin(c.object, "class", kernel_class);
    engine.define_builtin(c.object, "to_s", kernel_to_s);
    engine.define_builtin(c.object, "inspect", kernel_inspect);
    engine.define_builtin(c.object, "is_a?", kernel_is_a);
    engine.define_builtin(c.object, "kind_of?", kernel_is_a);
    engine.define_builtin(c.object, "respond_to?", kernel_respond_to);
    engine.define_builtin(c.object, "==", kernel_eq);

    engine.define_builtin(c.class, "new", class_new);
    engine.define_builtin(c.class, "name", class_name);

    engine.define_builtin(c.exception, "message", exception_message);
    engine.define_builtin(c.exception, "backtrace", exception_backtrace);

    engine.define_builtin(c.integer, "times", integer_times);
    engine.define_builtin(c.integer, "to_i", numeric_to_i);
    engine.define_builtin(c.integer, "to_f", numeric_to_f);
    engine.define_builtin(c.float, "to_i", numeric_to_i);
    engine.define_builtin(c.float, "to_f", numeric_to_f);
    engine.define_builtin(c.float, "to_s", float_to_s_method);

    engine.define_builtin(c.string, "length", string_length);
    engine.define_builtin(c.string, "size", string_length);
    engine.define_builtin(c.string, "to_sym", string_to_sym);
    engine.define_builtin(c.string, "upcase", string_upcase);

    engine.define_builtin(c.symbol, "to_sym", symbol_to_sym);

    engine.define_builtin(c.array, "length", array_length);
    engine.define_builtin(c.array, "size", array_length);
    engine.define_builtin(c.array, "[]", array_get);
    engine.define_builtin(c.array, "[]=", array_set);
    engine.define_builtin(c.array, "push", array_push);
    engine.define_builtin(c.array, "<<", array_push);
    engine.define_builtin(c.array, "first", array_first);
    engine.define_builtin(c.array, "last", array_last);
    engine.define_builtin(c.array, "each", array_each);
    engine.define_builtin(c.array, "map", array_map);
    engine.define_builtin(c.array, "join", array_join);

    engine.define_builtin(c.proc_, "call", proc_call);
}

fn check_arity(engine: &mut Engine, args: &[RawValue], min: usize, max: usize) -> Result<(), Unwind> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{}..{}", min, max)
        };
        return Err(engine.arity_error(args.len(), expected));
    }
    Ok(())
}

fn no_block(engine: &mut Engine) -> Unwind {
    let class = engine.classes.local_jump_error;
    engine.raise_error(class, "no block given (yield)")
}

// =========================================================================
// Kernel
// =========================================================================

fn kernel_puts(engine: &mut Engine, _recv: RawValue, args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    if args.is_empty() {
        println!();
    }
    for arg in args {
        match engine.array_elements(*arg) {
            Some(elements) => {
                for e in elements {
                    println!("{}", engine.to_s_raw(*e));
                }
            }
            None => println!("{}", engine.to_s_raw(*arg)),
        }
    }
    Ok(RawValue::nil())
}

fn kernel_p(engine: &mut Engine, _recv: RawValue, args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    for arg in args {
        println!("{}", engine.inspect_raw(*arg));
    }
    Ok(match args {
        [] => RawValue::nil(),
        [one] => *one,
        many => engine.new_array(many.to_vec())?,
    })
}

/// `raise`, `raise "msg"`, `raise Class`, `raise Class, "msg"`, `raise exc`.
fn kernel_raise(engine: &mut Engine, _recv: RawValue, args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    check_arity(engine, args, 0, 2)?;
    let exc = match args {
        [] => {
            let class = engine.classes.runtime_error;
            engine.new_exception(class, "unhandled exception")?
        }
        [first, rest @ ..] => {
            if let Some(msg) = engine.string_raw(*first).map(str::to_string) {
                if !rest.is_empty() {
                    return Err(engine.type_error("exception class/object expected"));
                }
                let class = engine.classes.runtime_error;
                engine.new_exception(class, msg)?
            } else if engine.is_class(*first) {
                let class_ptr = first.as_object().unwrap_or(engine.classes.runtime_error);
                if !engine.class_inherits(class_ptr, engine.classes.exception) {
                    return Err(engine.type_error("exception class/object expected"));
                }
                let msg = match rest.first() {
                    Some(m) => engine.to_s_raw(*m),
                    None => engine.class_name(class_ptr).to_string(),
                };
                engine.new_exception(class_ptr, msg)?
            } else if engine.is_exception(*first) && rest.is_empty() {
                *first
            } else {
                return Err(engine.type_error("exception class/object expected"));
            }
        }
    };
    Err(engine.raise(exc))
}

fn kernel_proc(engine: &mut Engine, _recv: RawValue, _args: &[RawValue], block: RawValue) -> Result<RawValue, Unwind> {
    if block.is_nil() {
        return Err(engine.argument_error("tried to create Proc object without a block"));
    }
    Ok(block)
}

fn kernel_block_given(engine: &mut Engine, _recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    // The caller's frame sits just below this builtin's own frame.
    let given = engine
        .ci
        .iter()
        .rev()
        .nth(1)
        .is_some_and(|ci| !ci.block.is_nil());
    Ok(RawValue::boolean(given))
}

fn kernel_nil_p(_engine: &mut Engine, recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    Ok(RawValue::boolean(recv.is_nil()))
}

fn kernel_class(engine: &mut Engine, recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    Ok(RawValue::object(engine.class_of(recv)))
}

fn kernel_to_s(engine: &mut Engine, recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    if engine.string_raw(recv).is_some() {
        return Ok(recv);
    }
    let s = engine.to_s_raw(recv);
    engine.new_string(s)
}

fn kernel_inspect(engine: &mut Engine, recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    let s = engine.inspect_raw(recv);
    engine.new_string(s)
}

fn kernel_is_a(engine: &mut Engine, recv: RawValue, args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    check_arity(engine, args, 1, 1)?;
    let Some(class) = args[0].as_object().filter(|_| engine.is_class(args[0])) else {
        return Err(engine.type_error("class or module required"));
    };
    Ok(RawValue::boolean(engine.is_kind_of(recv, class)))
}

fn kernel_respond_to(engine: &mut Engine, recv: RawValue, args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    check_arity(engine, args, 1, 1)?;
    let name = match args[0].as_symbol() {
        Some(sym) => sym,
        None => match engine.string_raw(args[0]).map(str::to_string) {
            Some(s) => engine.symbols.intern(&s),
            None => return Err(engine.type_error("not a symbol nor a string")),
        },
    };
    Ok(RawValue::boolean(engine.lookup_method(recv, name).is_some()))
}

fn kernel_eq(engine: &mut Engine, recv: RawValue, args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    check_arity(engine, args, 1, 1)?;
    Ok(RawValue::boolean(engine.values_eq(recv, args[0])))
}

// =========================================================================
// Class
// =========================================================================

fn class_new(engine: &mut Engine, recv: RawValue, args: &[RawValue], block: RawValue) -> Result<RawValue, Unwind> {
    let Some(class) = recv.as_object() else {
        return Err(engine.type_error("receiver is not a class"));
    };
    let data = if engine.class_inherits(class, engine.classes.exception) {
        let message = match args.first() {
            Some(m) => engine.to_s_raw(*m),
            None => engine.class_name(class).to_string(),
        };
        HeapData::Exception(ExceptionData {
            message,
            backtrace: Vec::new(),
        })
    } else {
        HeapData::Object
    };
    let obj = RawValue::object(engine.alloc(class, data)?);

    let initialize = engine.symbols.intern("initialize");
    if let Some(method) = engine.find_method(class, initialize) {
        engine.call_method(method, obj, initialize, args, block)?;
    } else if !engine.is_kind_of(obj, engine.classes.exception) && !args.is_empty() {
        return Err(engine.arity_error(args.len(), 0));
    }
    Ok(obj)
}

fn class_name(engine: &mut Engine, recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    let name = engine.inspect_raw(recv);
    engine.new_string(name)
}

// =========================================================================
// Exception
// =========================================================================

fn exception_message(engine: &mut Engine, recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    let msg = engine.exception_message(recv).unwrap_or_default().to_string();
    engine.new_string(msg)
}

fn exception_backtrace(engine: &mut Engine, recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    let lines = engine.exception_backtrace(recv);
    let arr = engine.new_array(Vec::with_capacity(lines.len()))?;
    for line in lines {
        let s = engine.new_string(line)?;
        engine.array_push_raw(arr, s);
    }
    Ok(arr)
}

// =========================================================================
// Numeric
// =========================================================================

fn integer_times(engine: &mut Engine, recv: RawValue, _args: &[RawValue], block: RawValue) -> Result<RawValue, Unwind> {
    if block.is_nil() {
        return Err(no_block(engine));
    }
    let n = recv.as_fixnum().unwrap_or(0);
    for i in 0..n {
        engine.call_block(block, &[RawValue::integer(i)])?;
    }
    Ok(recv)
}

fn numeric_to_i(_engine: &mut Engine, recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    Ok(match (recv.as_fixnum(), recv.as_float()) {
        (Some(_), _) => recv,
        (_, Some(f)) => RawValue::integer(f.trunc() as i64),
        _ => RawValue::integer(0),
    })
}

fn numeric_to_f(_engine: &mut Engine, recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    Ok(RawValue::float(recv.as_number().unwrap_or(0.0)))
}

fn float_to_s_method(engine: &mut Engine, recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    let s = float_to_s(recv.as_float().unwrap_or_default());
    engine.new_string(s)
}

// =========================================================================
// String / Symbol
// =========================================================================

fn string_length(engine: &mut Engine, recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    let len = engine.string_raw(recv).map(|s| s.chars().count()).unwrap_or(0);
    Ok(RawValue::integer(len as i64))
}

fn string_to_sym(engine: &mut Engine, recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    let s = engine.string_raw(recv).unwrap_or_default().to_string();
    Ok(RawValue::symbol(engine.symbols.intern(&s)))
}

fn string_upcase(engine: &mut Engine, recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    let s = engine.string_raw(recv).unwrap_or_default().to_uppercase();
    engine.new_string(s)
}

fn symbol_to_sym(_engine: &mut Engine, recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    Ok(recv)
}

// =========================================================================
// Array
// =========================================================================

impl Engine {
    pub(crate) fn array_push_raw(&mut self, arr: RawValue, v: RawValue) {
        if let Some(HeapData::Array(elements)) = arr
            .as_object()
            .and_then(|ptr| self.heap.get_mut(ptr))
            .map(|obj| &mut obj.data)
        {
            elements.push(v);
        }
    }

    fn array_get_raw(&self, arr: RawValue, index: usize) -> Option<RawValue> {
        self.array_elements(arr).and_then(|e| e.get(index)).copied()
    }
}

fn array_len(engine: &Engine, arr: RawValue) -> usize {
    engine.array_elements(arr).map(<[RawValue]>::len).unwrap_or(0)
}

fn array_length(engine: &mut Engine, recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    Ok(RawValue::integer(array_len(engine, recv) as i64))
}

fn index_arg(engine: &mut Engine, arg: RawValue) -> Result<i64, Unwind> {
    match arg.as_fixnum() {
        Some(i) => Ok(i),
        None => {
            let name = engine.class_name(engine.class_of(arg)).to_string();
            Err(engine.type_error(format!("no implicit conversion of {} into Integer", name)))
        }
    }
}

fn array_get(engine: &mut Engine, recv: RawValue, args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    check_arity(engine, args, 1, 1)?;
    let i = index_arg(engine, args[0])?;
    let len = array_len(engine, recv) as i64;
    let i = if i < 0 { i + len } else { i };
    if i < 0 {
        return Ok(RawValue::nil());
    }
    Ok(engine.array_get_raw(recv, i as usize).unwrap_or_default())
}

fn array_set(engine: &mut Engine, recv: RawValue, args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    check_arity(engine, args, 2, 2)?;
    let i = index_arg(engine, args[0])?;
    let len = array_len(engine, recv) as i64;
    let index = if i < 0 { i + len } else { i };
    if index < 0 {
        let class = engine.classes.index_error;
        return Err(engine.raise_error(class, format!("index {} too small for array; minimum: -{}", i, len)));
    }
    if index >= ARRAY_MAX_LEN as i64 {
        let class = engine.classes.index_error;
        return Err(engine.raise_error(class, format!("index {} too big", i)));
    }
    let value = args[1];
    let mut exhausted = false;
    if let Some(HeapData::Array(elements)) = recv
        .as_object()
        .and_then(|ptr| engine.heap.get_mut(ptr))
        .map(|obj| &mut obj.data)
    {
        let index = index as usize;
        if index >= elements.len() {
            if elements.try_reserve(index + 1 - elements.len()).is_ok() {
                elements.resize(index + 1, RawValue::nil());
            } else {
                exhausted = true;
            }
        }
        if !exhausted {
            elements[index] = value;
        }
    }
    if exhausted {
        return Err(engine.raise(engine.nomem_err));
    }
    Ok(value)
}

fn array_push(engine: &mut Engine, recv: RawValue, args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    for arg in args {
        engine.array_push_raw(recv, *arg);
    }
    Ok(recv)
}

fn array_first(engine: &mut Engine, recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    Ok(engine.array_get_raw(recv, 0).unwrap_or_default())
}

fn array_last(engine: &mut Engine, recv: RawValue, _args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    let len = array_len(engine, recv);
    Ok(match len {
        0 => RawValue::nil(),
        n => engine.array_get_raw(recv, n - 1).unwrap_or_default(),
    })
}

fn array_each(engine: &mut Engine, recv: RawValue, _args: &[RawValue], block: RawValue) -> Result<RawValue, Unwind> {
    if block.is_nil() {
        return Err(no_block(engine));
    }
    // Re-read each element so the block may mutate the array.
    let mut i = 0;
    while let Some(v) = engine.array_get_raw(recv, i) {
        engine.call_block(block, &[v])?;
        i += 1;
    }
    Ok(recv)
}

fn array_map(engine: &mut Engine, recv: RawValue, _args: &[RawValue], block: RawValue) -> Result<RawValue, Unwind> {
    if block.is_nil() {
        return Err(no_block(engine));
    }
    // Results go straight into an arena-pinned array so a collection inside
    // the block cannot free them.
    let out = engine.new_array(Vec::with_capacity(array_len(engine, recv)))?;
    let mut i = 0;
    while let Some(v) = engine.array_get_raw(recv, i) {
        let mapped = engine.call_block(block, &[v])?;
        engine.array_push_raw(out, mapped);
        i += 1;
    }
    Ok(out)
}

fn array_join(engine: &mut Engine, recv: RawValue, args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    check_arity(engine, args, 0, 1)?;
    let sep = match args.first() {
        Some(s) => engine.to_s_raw(*s),
        None => String::new(),
    };
    let parts: Vec<String> = engine
        .array_elements(recv)
        .unwrap_or_default()
        .iter()
        .map(|v| engine.to_s_raw(*v))
        .collect();
    engine.new_string(parts.join(&sep))
}

// =========================================================================
// Proc
// =========================================================================

fn proc_call(engine: &mut Engine, recv: RawValue, args: &[RawValue], _block: RawValue) -> Result<RawValue, Unwind> {
    engine.call_block(recv, args)
}

