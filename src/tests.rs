use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::runtime::{ArgSpec, BridgeError, BridgeResult, Classified, GuestException, Value, ValueType};
use crate::vm::{Engine, EngineConfig};

fn raised(result: BridgeResult<Value>) -> GuestException {
    match result {
        Err(BridgeError::Raised(exc)) => exc,
        other => panic!("expected a contained guest exception, got {:?}", other),
    }
}

fn engine_with_threshold(threshold: usize) -> Engine {
    let mut config = EngineConfig::default();
    config.heap.gc_threshold = threshold;
    Engine::with_config(config)
}

// =========================================================================
// Classification and liveness
// =========================================================================

#[test]
fn test_immediates_are_never_heap_or_dead() {
    let mut engine = Engine::new();
    let values = [
        engine.load_string("nil").expect("nil"),
        engine.load_string("true").expect("true"),
        engine.load_string("42").expect("fixnum"),
        engine.load_string("1.5").expect("float"),
        engine.load_string(":sym").expect("symbol"),
    ];
    for v in values {
        assert!(v.is_immediate(), "{:?}", v);
        assert!(matches!(v.classify(), Classified::Immediate(_)));
        assert!(!engine.is_dead(v));
    }
    assert_eq!(values[2].as_fixnum(), Ok(42));
    assert_eq!(values[3].as_float(), Ok(1.5));
}

#[test]
fn test_fresh_objects_are_alive() {
    let mut engine = Engine::new();
    let s = engine.load_string("'fresh'").expect("string");
    assert!(matches!(s.classify(), Classified::Heap(_)));
    assert!(!engine.is_dead(s));
    assert_eq!(engine.vtype(s), Ok(ValueType::String));

    let header = engine.object_header(s.as_object().expect("object")).expect("header");
    assert_eq!(header.kind, crate::ObjectKind::String);
}

#[test]
fn test_collected_objects_are_dead() {
    let mut engine = Engine::new();
    let mark = engine.arena_save();
    let arr = engine.load_string("[1, 2, 3]").expect("array");
    assert!(!engine.is_dead(arr));
    engine.arena_restore(mark);

    engine.full_gc();
    assert!(engine.is_dead(arr));
    assert!(matches!(engine.array(arr), Err(BridgeError::DeadReference(_))));
    assert!(matches!(engine.inspect(arr), Err(BridgeError::DeadReference(_))));
}

#[test]
fn test_protected_results_survive_collection() {
    let mut engine = engine_with_threshold(64);
    let kept = engine.load_string("'keep me'").expect("string");
    engine
        .load_string("i = 0\nwhile i < 300\n  'garbage' + i.to_s\n  i += 1\nend")
        .expect("churn");
    assert!(engine.gc_stats().collections > 0);
    assert!(!engine.is_dead(kept));
    assert_eq!(engine.string(kept), Ok("keep me".to_string()));
}

#[test]
fn test_guest_locals_survive_collection_during_execution() {
    let mut engine = engine_with_threshold(64);
    let v = engine
        .load_string(
            "keep = ['a', 'b']\ni = 0\nwhile i < 500\n  'x' + 'y'\n  i += 1\nend\nkeep.join('-')",
        )
        .expect("run");
    assert!(engine.gc_stats().collections > 0);
    assert_eq!(engine.string(v), Ok("a-b".to_string()));
}

// =========================================================================
// GC switch
// =========================================================================

#[test]
fn test_disabled_window_keeps_every_allocation() {
    let mut engine = engine_with_threshold(32);
    let collections = engine.gc_stats().collections;
    let before = engine.live_count();

    let mut made = Vec::new();
    {
        let mut paused = engine.pause_gc();
        for i in 0..200 {
            let mark = paused.arena_save();
            made.push(paused.str_new(&i.to_string()).expect("str_new"));
            paused.arena_restore(mark);
        }
        assert_eq!(paused.live_count(), before + 200);
        assert!(made.iter().all(|v| !paused.is_dead(*v)));
        assert_eq!(paused.gc_stats().collections, collections);
    }

    assert!(!engine.gc_disabled());
    engine.full_gc();
    assert!(made.iter().all(|v| engine.is_dead(*v)));
    assert_eq!(engine.live_count(), before);
}

#[test]
fn test_guest_code_runs_with_gc_disabled() {
    let mut engine = engine_with_threshold(32);
    engine.disable_gc();
    let before = engine.live_count();
    engine
        .load_string("i = 0\nwhile i < 100\n  'tmp'\n  i += 1\nend")
        .expect("run");
    assert!(engine.live_count() >= before + 100);
    assert_eq!(engine.gc_stats().collections, 0);
    engine.enable_gc();
    assert!(engine.full_gc() >= 100);
}

// =========================================================================
// Trampoline
// =========================================================================

#[test]
fn test_jump_depth_is_balanced() {
    let mut engine = Engine::new();
    for src in ["1 + 1", "raise 'boom'", "undefined_thing", "[1].each { |x| x }", "1 / 0"] {
        let _ = engine.load_string(src);
        assert_eq!(engine.jump_depth(), 0, "after {:?}", src);
    }
}

#[test]
fn test_guest_exception_details() {
    let mut engine = Engine::new();
    let exc = raised(engine.load_string("def inner\n  raise 'deep'\nend\ndef outer\n  inner\nend\nouter"));
    assert_eq!(exc.class_name, "RuntimeError");
    assert_eq!(exc.message, "deep");
    assert_eq!(exc.to_string(), "RuntimeError: deep");
    let inner = exc.backtrace.iter().position(|m| m == "inner").expect("inner in backtrace");
    let outer = exc.backtrace.iter().position(|m| m == "outer").expect("outer in backtrace");
    assert!(inner < outer);
    assert_eq!(engine.vtype(exc.value), Ok(ValueType::Exception));
}

#[test]
fn test_builtin_error_classes() {
    let mut engine = Engine::new();
    assert_eq!(raised(engine.load_string("1 / 0")).class_name, "ZeroDivisionError");
    assert_eq!(raised(engine.load_string("nope")).class_name, "NameError");
    assert_eq!(raised(engine.load_string("1.nope")).class_name, "NoMethodError");
    assert_eq!(raised(engine.load_string("yield")).class_name, "LocalJumpError");
    assert_eq!(raised(engine.load_string("[].fetch_nothing")).class_name, "NoMethodError");
}

#[test]
fn test_guest_rescue_handles_exception_without_reaching_host() {
    let mut engine = Engine::new();
    let v = engine
        .load_string("begin\n  1 / 0\nrescue ZeroDivisionError => e\n  e.message\nend")
        .expect("rescued");
    assert_eq!(engine.string(v), Ok("divided by 0".to_string()));
    assert!(engine.exception().is_nil());
}

#[test]
fn test_unmatched_rescue_reaches_host() {
    let mut engine = Engine::new();
    let exc = raised(engine.load_string("begin\n  raise TypeError, 'bad'\nrescue ArgumentError\n  1\nend"));
    assert_eq!(exc.class_name, "TypeError");
}

#[test]
fn test_deep_recursion_raises_system_stack_error() {
    let config = EngineConfig {
        max_call_depth: 48,
        ..EngineConfig::default()
    };
    let mut engine = Engine::with_config(config);
    let exc = raised(engine.load_string("def down(n)\n  down(n + 1)\nend\ndown(0)"));
    assert_eq!(exc.class_name, "SystemStackError");
    assert_eq!(engine.jump_depth(), 0);
    assert_eq!(engine.load_string("7"), Ok(Value::Fixnum(7)));
}

#[test]
fn test_heap_exhaustion_raises_no_memory_error() {
    let mut config = EngineConfig::default();
    config.heap.max_objects = 1;
    let mut engine = Engine::with_config(config);
    let exc = raised(engine.load_string("'x'"));
    assert_eq!(exc.class_name, "NoMemoryError");
    assert_eq!(exc.message, "failed to allocate memory");
}

// =========================================================================
// Callback bridge
// =========================================================================

#[test]
fn test_accumulator_order_with_and_without_block() {
    let mut engine = Engine::new();
    let object = engine.object_class();
    engine
        .define_method(object, "collect", ArgSpec::any() | ArgSpec::block(), |engine, _, slots| {
            let args = engine.get_args();
            slots.set_result(engine.ary_new(args.as_slice())?);
            Ok(())
        })
        .expect("define");

    let with_block = engine.load_string("collect(1, 'a', nil) { |x| x }").expect("call");
    let items = engine.array(with_block).expect("array");
    assert_eq!(items.len(), 4);
    assert_eq!(items[0], Value::Fixnum(1));
    assert_eq!(engine.string(items[1]), Ok("a".to_string()));
    assert_eq!(items[2], Value::Nil);
    assert_eq!(engine.vtype(items[3]), Ok(ValueType::Proc));
    assert!(engine.proc_ptr(items[3]).is_ok());

    let without = engine.load_string("collect(1, 'a', nil)").expect("call");
    let items = engine.array(without).expect("array");
    assert_eq!(items.len(), 3);
    assert_eq!(items[2], Value::Nil);

    let empty = engine.load_string("collect").expect("call");
    assert_eq!(engine.array(empty), Ok(Vec::new()));
}

#[test]
fn test_host_can_yield_the_block_it_received() {
    let mut engine = Engine::new();
    let object = engine.object_class();
    engine
        .define_method(object, "twice", ArgSpec::req(1) | ArgSpec::block(), |engine, _, slots| {
            let args = engine.get_args();
            let (Some(n), Some(block)) = (args.get(0), args.get(1)) else {
                return Err(BridgeError::host("twice needs a value and a block"));
            };
            let once = engine.yield_block(block, &[n])?;
            slots.set_result(engine.yield_block(block, &[once])?);
            Ok(())
        })
        .expect("define");

    assert_eq!(engine.load_string("twice(3) { |x| x * x }"), Ok(Value::Fixnum(81)));
    assert_eq!(raised(engine.load_string("twice(3)")).class_name, "RuntimeError");
}

#[test]
fn test_nested_containment() {
    let mut engine = Engine::new();
    engine
        .load_string("def risky(n)\n  raise ArgumentError, 'nested' if n > 1\n  n\nend")
        .expect("def");

    let depth_seen = Rc::new(Cell::new(0));
    let seen = Rc::clone(&depth_seen);
    let object = engine.object_class();
    engine
        .define_method(object, "try_risky", ArgSpec::req(1), move |engine, recv, slots| {
            let n = engine.get_args().get(0).unwrap_or_default();
            seen.set(engine.jump_depth());
            match engine.funcall(recv, "risky", &[n]) {
                Ok(v) => slots.set_result(v),
                Err(BridgeError::Raised(exc)) => {
                    let text = format!("contained {}", exc.class_name);
                    slots.set_result(engine.str_new(&text)?);
                }
                Err(other) => return Err(other),
            }
            Ok(())
        })
        .expect("define");

    let v = engine.load_string("[try_risky(1), try_risky(5)]").expect("outer call succeeds");
    let items = engine.array(v).expect("array");
    assert_eq!(items[0], Value::Fixnum(1));
    assert_eq!(engine.string(items[1]), Ok("contained ArgumentError".to_string()));
    assert_eq!(depth_seen.get(), 1);
    assert_eq!(engine.jump_depth(), 0);
    assert!(engine.exception().is_nil());
}

#[test]
fn test_propagated_inner_exception_is_rescued_by_guest() {
    let mut engine = Engine::new();
    engine
        .load_string("def checked(n)\n  raise IndexError, 'too big' if n > 9\n  n\nend")
        .expect("def");
    let object = engine.object_class();
    engine
        .define_method(object, "relay", ArgSpec::req(1), |engine, recv, slots| {
            let n = engine.get_args().get(0).unwrap_or_default();
            slots.set_result(engine.funcall(recv, "checked", &[n])?);
            Ok(())
        })
        .expect("define");

    let v = engine
        .load_string("begin\n  relay(10)\nrescue IndexError => e\n  e.message\nend")
        .expect("rescued");
    assert_eq!(engine.string(v), Ok("too big".to_string()));
    assert_eq!(engine.load_string("relay(4)"), Ok(Value::Fixnum(4)));
}

/// `class_after_failure(name)` runs a nested guest call that allocates enough
/// to collect and then raises, records what it contained, and returns the
/// class called `name`.
fn define_class_after_failure(engine: &mut Engine) -> Rc<RefCell<Vec<String>>> {
    let contained = Rc::new(RefCell::new(Vec::new()));
    let record = Rc::clone(&contained);
    let object = engine.object_class();
    engine
        .define_method(object, "class_after_failure", ArgSpec::req(1), move |engine, _, slots| {
            let name = engine.string(engine.get_args().get(0).unwrap_or_default())?;
            let nested = "i = 0\nwhile i < 200\n  'garbage'\n  i += 1\nend\nraise TypeError, 'inner'";
            match engine.load_string(nested) {
                Err(BridgeError::Raised(exc)) => record.borrow_mut().push(exc.class_name),
                other => return Err(BridgeError::host(format!("nested call did not raise: {:?}", other))),
            }
            slots.set_result(engine.class_get(&name)?);
            Ok(())
        })
        .expect("define");
    contained
}

#[test]
fn test_nested_raise_during_rescue_keeps_outer_exception() {
    let mut engine = engine_with_threshold(16);
    let contained = define_class_after_failure(&mut engine);

    let v = engine
        .load_string(
            "begin\n  raise ArgumentError, 'outer'\nrescue class_after_failure('ArgumentError') => e\n  e.message\nend",
        )
        .expect("outer exception rescued");
    assert_eq!(engine.string(v), Ok("outer".to_string()));
    assert_eq!(*contained.borrow(), vec!["TypeError".to_string()]);
    assert_eq!(engine.jump_depth(), 0);
    assert!(engine.exception().is_nil());
}

#[test]
fn test_unmatched_rescue_reraises_outer_exception_after_nested_raise() {
    let mut engine = engine_with_threshold(16);
    let contained = define_class_after_failure(&mut engine);

    let exc = raised(engine.load_string(
        "begin\n  raise ArgumentError, 'outer'\nrescue class_after_failure('IndexError')\n  :unreachable\nend",
    ));
    assert_eq!(exc.class_name, "ArgumentError");
    assert_eq!(exc.message, "outer");
    assert_eq!(contained.borrow().len(), 1);
    assert_eq!(engine.exception(), exc.value);
}

#[test]
fn test_exception_slot_makes_guest_observe_raise() {
    let mut engine = Engine::new();
    let object = engine.object_class();
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    engine
        .define_method(object, "deny", ArgSpec::none(), move |engine, _, slots| {
            counter.set(counter.get() + 1);
            slots.set_exception(engine.exception_new("RuntimeError", "denied by host")?);
            Ok(())
        })
        .expect("define");

    let exc = raised(engine.load_string("deny\n:unreachable"));
    assert_eq!(exc.class_name, "RuntimeError");
    assert_eq!(exc.message, "denied by host");
    assert_eq!(calls.get(), 1);

    let v = engine
        .load_string("r = begin\n  deny\nrescue => e\n  e.class.name\nend\nr")
        .expect("rescued");
    assert_eq!(engine.string(v), Ok("RuntimeError".to_string()));
}

#[test]
fn test_host_methods_on_defined_classes() {
    let mut engine = Engine::new();
    let object = engine.object_class();
    let counter = engine.define_class("Counter", object).expect("class");
    engine
        .define_method(counter, "bump", ArgSpec::opt(1), |engine, _, slots| {
            let by = engine.get_args().get(0).unwrap_or(Value::Fixnum(1));
            slots.set_result(by.as_fixnum()? + 1);
            Ok(())
        })
        .expect("define");

    assert_eq!(engine.load_string("Counter.new.bump"), Ok(Value::Fixnum(2)));
    assert_eq!(engine.load_string("Counter.new.bump(41)"), Ok(Value::Fixnum(42)));
    assert_eq!(raised(engine.load_string("Counter.new.bump(1, 2)")).class_name, "ArgumentError");
    assert_eq!(raised(engine.load_string("Counter.new.bump('x')")).class_name, "TypeError");

    let c = engine.load_string("Counter.new").expect("instance");
    assert_eq!(engine.funcall(c, "bump", &[Value::Fixnum(9)]), Ok(Value::Fixnum(10)));
    assert_eq!(engine.inspect(c), Ok("#<Counter>".to_string()));
}

// =========================================================================
// Guest language
// =========================================================================

#[test]
fn test_blocks_yield_and_break() {
    let mut engine = Engine::new();
    let src = "def each_twice\n  yield 1\n  yield 2\nend\nsum = 0\neach_twice { |x| sum = sum + x }\nsum";
    assert_eq!(engine.load_string(src), Ok(Value::Fixnum(3)));

    let v = engine.load_string("[1, 2, 3].each { |x| break x * 10 if x == 2 }");
    assert_eq!(v, Ok(Value::Fixnum(20)));

    let v = engine.load_string("def find\n  [4, 5, 6].each { |x| return x if x > 4 }\n  nil\nend\nfind");
    assert_eq!(v, Ok(Value::Fixnum(5)));
}

#[test]
fn test_arrays_and_strings() {
    let mut engine = Engine::new();
    let v = engine.load_string("[1, 2, 3].map { |x| x * 2 }").expect("map");
    assert_eq!(
        engine.array(v),
        Ok(vec![Value::Fixnum(2), Value::Fixnum(4), Value::Fixnum(6)])
    );
    let v = engine.load_string("'ab'.upcase + 'c'").expect("string");
    assert_eq!(engine.string(v), Ok("ABc".to_string()));
    assert_eq!(engine.load_string("7 / -2"), Ok(Value::Fixnum(-4)));
    assert_eq!(engine.load_string("-7 % 3"), Ok(Value::Fixnum(2)));
}

#[test]
fn test_self_containing_arrays() {
    let mut engine = Engine::new();
    let v = engine.load_string("a = [1]\na << a\na.inspect").expect("inspect");
    assert_eq!(engine.string(v), Ok("[1, [...]]".to_string()));

    let v = engine.load_string("a = [1]\na << a\nb = [1]\nb << b\na == b").expect("eq");
    assert_eq!(v, Value::Bool(true));
    let v = engine.load_string("a = [1]\na << a\nb = [2]\nb << b\na == b").expect("ne");
    assert_eq!(v, Value::Bool(false));

    let v = engine.load_string("a = [1]\na << a\n[a, a].inspect").expect("siblings");
    assert_eq!(engine.string(v), Ok("[[1, [...]], [1, [...]]]".to_string()));
}

#[test]
fn test_deeply_nested_arrays_compare_and_render() {
    let mut engine = Engine::new();
    let v = engine
        .load_string("a = []\nb = []\ni = 0\nwhile i < 100000\n  a = [a]\n  b = [b]\n  i += 1\nend\n[a == b, a.inspect.length]")
        .expect("nested");
    let items = engine.array(v).expect("array");
    assert_eq!(items, vec![Value::Bool(true), Value::Fixnum(200_002)]);
}

#[test]
fn test_index_assignment_past_the_limit_raises() {
    let mut engine = Engine::new();
    let exc = raised(engine.load_string("a = []\na[100000000000] = 1"));
    assert_eq!(exc.class_name, "IndexError");
    assert_eq!(exc.message, "index 100000000000 too big");

    let v = engine
        .load_string("a = []\nbegin\n  a[140737488355327] = 1\nrescue IndexError\n  a[3] = :ok\nend\na.length")
        .expect("rescued");
    assert_eq!(v, Value::Fixnum(4));
}

#[test]
fn test_deeply_nested_source_is_a_syntax_error() {
    let mut engine = Engine::new();
    let src = format!("{}1{}", "[".repeat(5000), "]".repeat(5000));
    let exc = raised(engine.load_string(&src));
    assert_eq!(exc.class_name, "SyntaxError");
    assert!(exc.message.ends_with("nesting too deep"), "{}", exc.message);
    assert_eq!(engine.jump_depth(), 0);

    assert!(engine.parse(&"(".repeat(200_000)).is_err());
    assert_eq!(engine.load_string("[[[1]]].first.first.first"), Ok(Value::Fixnum(1)));
}

#[test]
fn test_instance_variables_and_initialize() {
    let mut engine = Engine::new();
    let object = engine.object_class();
    engine.define_class("Box", object).expect("class");
    let src = "def initialize(v)\n  @v = v\nend\ndef value\n  @v\nend\nBox.new(11).value";
    assert_eq!(engine.load_string(src), Ok(Value::Fixnum(11)));
}
