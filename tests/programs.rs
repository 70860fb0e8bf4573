//! End-to-end programs built with `AstArena`, run through the public API.

use marrow::ast::{AstArena, Node, NodeKind};
use marrow::config::VmConfig;
use marrow::error::{ExceptionKind, RuntimeError};
use marrow::vm::{Compiler, OutputBuffer, TraceLog, Vm};
use pretty_assertions::assert_eq;

fn run_with(config: VmConfig, tree: &Node<'_>) -> (Result<String, RuntimeError>, String) {
    let program = Compiler::compile(tree, "program.mw").expect("compiles");
    let output = OutputBuffer::new();
    let mut vm = Vm::with_config(config);
    vm.set_output(Box::new(output.clone()));
    let result = vm.execute(&program).map(|value| vm.display(value));
    (result, output.contents())
}

/// Runs normally and under GC stress; both runs must agree.
fn run(tree: &Node<'_>) -> Result<String, RuntimeError> {
    let normal = run_with(VmConfig::default(), tree);
    let stressed = run_with(VmConfig::default().gc_stress(true), tree);
    assert_eq!(normal, stressed);
    normal.0
}

/// class Point { constructor(x, y) { self.x = x; self.y = y; } sum() { return self.x + self.y; } }
fn point_class(arena: &AstArena) -> &Node<'_> {
    let ctor = arena.function(
        "constructor",
        &["x", "y"],
        arena.block(&[
            arena.assign(arena.prop(arena.self_ref(), "x"), arena.ident("x")),
            arena.assign(arena.prop(arena.self_ref(), "y"), arena.ident("y")),
        ]),
    );
    let sum = arena.function(
        "sum",
        &[],
        arena.block(&[arena.ret(Some(arena.binary(
            NodeKind::Add,
            arena.prop(arena.self_ref(), "x"),
            arena.prop(arena.self_ref(), "y"),
        )))]),
    );
    arena.class("Point", None, &[ctor, sum])
}

#[test]
fn test_objects_in_a_loop() {
    let arena = AstArena::new();
    // total = 0; for (i = 0; i < 30; i++) { p = Point(i, 1); total += p.sum(); } return total;
    let body = arena.block(&[
        arena.set("p", arena.call_named("Point", &[arena.ident("i"), arena.long(1)])),
        arena.compound(
            NodeKind::AddAssign,
            arena.ident("total"),
            arena.method(arena.ident("p"), "sum", &[]),
        ),
    ]);
    let tree = arena.program(&[
        point_class(&arena),
        arena.set("total", arena.long(0)),
        arena.for_loop(
            arena.set("i", arena.long(0)),
            arena.binary(NodeKind::Lt, arena.ident("i"), arena.long(30)),
            arena.step(NodeKind::PostInc, arena.ident("i")),
            body,
        ),
        arena.ret(Some(arena.ident("total"))),
    ]);
    // sum of 0..30 plus thirty ones
    assert_eq!(run(tree), Ok("465".to_string()));
}

#[test]
fn test_recursive_fibonacci() {
    let arena = AstArena::new();
    let call = |delta: i64| {
        arena.call_named(
            "fib",
            &[arena.binary(NodeKind::Sub, arena.ident("n"), arena.long(delta))],
        )
    };
    let body = arena.block(&[
        arena.if_else(
            arena.binary(NodeKind::Lt, arena.ident("n"), arena.long(2)),
            arena.block(&[arena.ret(Some(arena.ident("n")))]),
            None,
        ),
        arena.ret(Some(arena.binary(NodeKind::Add, call(1), call(2)))),
    ]);
    let fib = arena.function("fib", &["n"], body);
    let tree = arena.program(&[fib, arena.ret(Some(arena.call_named("fib", &[arena.long(15)])))]);
    assert_eq!(run(tree), Ok("610".to_string()));
}

#[test]
fn test_maps_and_membership() {
    let arena = AstArena::new();
    // m = {"a": 1}; m["b"] = 2; print("b" in m, len(m), m.a + m["b"]);
    let tree = arena.program(&[
        arena.set("m", arena.map(&[(arena.string("a"), arena.long(1))])),
        arena.assign(arena.index(arena.ident("m"), arena.string("b")), arena.long(2)),
        arena.call_named(
            "print",
            &[
                arena.binary(NodeKind::In, arena.string("b"), arena.ident("m")),
                arena.call_named("len", &[arena.ident("m")]),
                arena.binary(
                    NodeKind::Add,
                    arena.prop(arena.ident("m"), "a"),
                    arena.index(arena.ident("m"), arena.string("b")),
                ),
            ],
        ),
    ]);
    let (result, output) = run_with(VmConfig::default(), tree);
    assert_eq!(result, Ok("null".to_string()));
    assert_eq!(output, "true 2 3\n");
}

#[test]
fn test_exception_crosses_method_frames() {
    let arena = AstArena::new();
    // class Box { open() { throw "locked"; } }
    // try { Box().open(); } catch (e) { return "caught " + e; }
    let open = arena.function("open", &[], arena.block(&[arena.throw(arena.string("locked"))]));
    let guarded = arena.try_catch(
        arena.block(&[arena.method(arena.call_named("Box", &[]), "open", &[])]),
        "e",
        arena.block(&[arena.ret(Some(arena.binary(
            NodeKind::Add,
            arena.string("caught "),
            arena.ident("e"),
        )))]),
    );
    let tree = arena.program(&[arena.class("Box", None, &[open]), guarded]);
    assert_eq!(run(tree), Ok("caught locked".to_string()));
}

#[test]
fn test_integer_overflow_traps() {
    let arena = AstArena::new();
    let tree = arena.program(&[arena.ret(Some(arena.binary(
        NodeKind::Add,
        arena.long(i64::MAX),
        arena.long(1),
    )))]);
    let err = run(tree).unwrap_err();
    assert_eq!(err.kind(), Some(ExceptionKind::RuntimeError));
    assert_eq!(err.message(), "integer overflow");
}

#[test]
fn test_tracing_leaves_results_unchanged() {
    let arena = AstArena::new();
    let tree = arena.program(&[
        arena.set("x", arena.long(5)),
        arena.set("x", arena.binary(NodeKind::Add, arena.ident("x"), arena.long(1))),
        arena.ret(Some(arena.ident("x"))),
    ]);
    let program = Compiler::compile(tree, "trace.mw").expect("compiles");
    let log = TraceLog::new();
    let mut vm = Vm::new();
    vm.set_tracer(Box::new(log.clone()));
    let value = vm.execute(&program).expect("runs");
    assert_eq!(vm.display(value), "6");

    // Straight-line code: one record per address, in order.
    let records = log.records();
    let addresses: Vec<usize> = records.iter().map(|r| r.address).collect();
    assert_eq!(addresses, (0..records.len()).collect::<Vec<_>>());
    assert_eq!(records.last().map(|r| r.opcode), Some("IRETURN"));
}

#[test]
fn test_runaway_recursion_stops_at_depth_limit() {
    let arena = AstArena::new();
    let forever = arena.function(
        "forever",
        &[],
        arena.block(&[arena.ret(Some(arena.call_named("forever", &[])))]),
    );
    let tree = arena.program(&[forever, arena.call_named("forever", &[])]);
    let (result, _) = run_with(VmConfig::default().max_frames(100), tree);
    match result {
        Err(RuntimeError::Uncaught(uncaught)) => {
            assert_eq!(uncaught.kind, ExceptionKind::RuntimeError);
            assert_eq!(uncaught.backtrace.len(), 99);
            assert!(uncaught.backtrace.iter().all(|entry| entry.function == "forever"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_calls_work_after_depth_limit_is_caught() {
    let arena = AstArena::new();
    // function forever() { return forever(); } function one() { return 1; }
    // try { forever(); } catch (e) { return e + ": " + one(); }
    let forever = arena.function(
        "forever",
        &[],
        arena.block(&[arena.ret(Some(arena.call_named("forever", &[])))]),
    );
    let one = arena.function("one", &[], arena.block(&[arena.ret(Some(arena.long(1)))]));
    let message = arena.binary(
        NodeKind::Add,
        arena.binary(NodeKind::Add, arena.ident("e"), arena.string(": ")),
        arena.call_named("one", &[]),
    );
    let tree = arena.program(&[
        forever,
        one,
        arena.try_catch(
            arena.block(&[arena.call_named("forever", &[])]),
            "e",
            arena.block(&[arena.ret(Some(message))]),
        ),
    ]);
    let normal = run_with(VmConfig::default().max_frames(50), tree);
    let stressed = run_with(VmConfig::default().max_frames(50).gc_stress(true), tree);
    assert_eq!(normal, stressed);
    assert_eq!(normal.0, Ok("maximum call depth exceeded: 1".to_string()));
}
