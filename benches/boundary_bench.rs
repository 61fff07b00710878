//! Boundary round-trip benchmarks
//!
//! Run with: cargo bench --bench boundary_bench

use std::hint::black_box;
use std::time::Instant;

use mrglue::{ArgSpec, BridgeError, Engine, Value};

// Simple timing macro for benchmarks
macro_rules! bench {
    ($name:expr, $iterations:expr, $code:block) => {{
        let start = Instant::now();
        for _ in 0..$iterations {
            black_box($code);
        }
        let elapsed = start.elapsed();
        let per_iter = elapsed / $iterations;
        println!(
            "{}: {} iterations in {:?} ({:?}/iter, {:.0} ops/sec)",
            $name,
            $iterations,
            elapsed,
            per_iter,
            $iterations as f64 / elapsed.as_secs_f64()
        );
        elapsed
    }};
}

fn bench_trampoline() {
    println!("\n=== Trampoline ===");
    let mut engine = Engine::new();
    let program = engine.parse("1 + 2").expect("parse");
    let main = engine.load_string("self").expect("self");
    engine
        .load_string("def add(a, b)\n  a + b\nend")
        .expect("def");

    bench!("run (returned)", 100_000u32, {
        let mark = engine.arena_save();
        let v = engine.run(&program);
        engine.arena_restore(mark);
        v
    });

    let failing = engine.parse("raise 'x'").expect("parse");
    bench!("run (raised)", 50_000u32, {
        let mark = engine.arena_save();
        let v = engine.run(&failing).is_err();
        engine.arena_restore(mark);
        v
    });

    bench!("funcall", 100_000u32, {
        engine.funcall(main, "add", &[Value::Fixnum(1), Value::Fixnum(2)])
    });
}

fn bench_callback() {
    println!("\n=== Host callback ===");
    let mut engine = Engine::new();
    let object = engine.object_class();
    engine
        .define_method(object, "host_add", ArgSpec::req(2), |engine, _, slots| {
            let args = engine.get_args();
            let (a, b) = match (args.get(0), args.get(1)) {
                (Some(a), Some(b)) => (a.as_fixnum()?, b.as_fixnum()?),
                _ => return Err(BridgeError::host("two arguments expected")),
            };
            slots.set_result(a + b);
            Ok(())
        })
        .expect("define");
    let program = engine
        .parse("i = 0\nwhile i < 1000\n  host_add(i, 1)\n  i += 1\nend")
        .expect("parse");

    bench!("1000 guest->host calls", 200u32, {
        let mark = engine.arena_save();
        let v = engine.run(&program);
        engine.arena_restore(mark);
        v
    });
}

fn bench_gc() {
    println!("\n=== Collector ===");
    let mut engine = Engine::new();
    bench!("alloc + full_gc (1000 strings)", 100u32, {
        let mark = engine.arena_save();
        for _ in 0..1000 {
            let _ = engine.str_new("garbage");
        }
        engine.arena_restore(mark);
        engine.full_gc()
    });
}

fn main() {
    bench_trampoline();
    bench_callback();
    bench_gc();
}
