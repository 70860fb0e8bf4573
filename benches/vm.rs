//! VM benchmarks: recursive calls, loops with allocation, and collection.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use marrow::ast::{AstArena, Node, NodeKind};
use marrow::config::VmConfig;
use marrow::vm::{CompiledProgram, Compiler, OutputBuffer, Vm};

fn compile(tree: &Node<'_>) -> CompiledProgram {
    Compiler::compile(tree, "bench.mw").expect("compile error")
}

/// function fib(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); } return fib(N);
fn fib_program(n: i64) -> CompiledProgram {
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
    compile(arena.program(&[fib, arena.ret(Some(arena.call_named("fib", &[arena.long(n)])))]))
}

/// xs = []; for (i = 0; i < N; i++) { xs.push([i, "s" + i]); } return len(xs);
fn alloc_program(n: i64) -> CompiledProgram {
    let arena = AstArena::new();
    let item = arena.array(&[
        arena.ident("i"),
        arena.binary(NodeKind::Add, arena.string("s"), arena.ident("i")),
    ]);
    let body = arena.block(&[arena.method(arena.ident("xs"), "push", &[item])]);
    compile(arena.program(&[
        arena.set("xs", arena.array(&[])),
        arena.for_loop(
            arena.set("i", arena.long(0)),
            arena.binary(NodeKind::Lt, arena.ident("i"), arena.long(n)),
            arena.step(NodeKind::PostInc, arena.ident("i")),
            body,
        ),
        arena.ret(Some(arena.call_named("len", &[arena.ident("xs")]))),
    ]))
}

fn run(program: &CompiledProgram, config: VmConfig) {
    let mut vm = Vm::with_config(config);
    vm.set_output(Box::new(OutputBuffer::new()));
    vm.execute(program).expect("vm runtime error");
}

fn fibonacci(c: &mut Criterion) {
    let mut group = c.benchmark_group("fib_recursive");
    for n in [15, 20] {
        let program = fib_program(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &program, |b, program| {
            b.iter(|| run(black_box(program), VmConfig::default()))
        });
    }
    group.finish();
}

fn allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_loop");
    let program = alloc_program(2_000);
    for threshold in [64, 1024] {
        group.bench_with_input(
            BenchmarkId::new("gc_threshold", threshold),
            &program,
            |b, program| b.iter(|| run(black_box(program), VmConfig::default().gc_threshold(threshold))),
        );
    }
    group.finish();
}

fn compilation(c: &mut Criterion) {
    c.bench_function("compile_fib", |b| b.iter(|| fib_program(black_box(20))));
}

criterion_group!(benches, fibonacci, allocation, compilation);
criterion_main!(benches);
