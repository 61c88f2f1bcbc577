//! Dispatch-loop throughput: a tight interpreted countdown.

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use vesper::{Chunk, CompiledDef, Context, Interpreter, OpCode, TypeId, TypeTable};

fn countdown_def(iterations: i64) -> CompiledDef {
    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::PutI64);
    chunk.write_i64(iterations);
    chunk.write_op(OpCode::SetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);

    let loop_start = chunk.current_offset() as u32;
    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    chunk.write_op(OpCode::PutI64);
    chunk.write_i64(0);
    chunk.write_op(OpCode::CmpI64);
    chunk.write_op(OpCode::CmpLe);
    let exit_jump = chunk.emit_jump(OpCode::BranchIf);
    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    chunk.write_op(OpCode::PutI64);
    chunk.write_i64(1);
    chunk.write_op(OpCode::SubI64);
    chunk.write_op(OpCode::SetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    chunk.write_op(OpCode::Jump);
    chunk.write_u32(loop_start);
    chunk.patch_jump(exit_jump);
    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    chunk.write_op(OpCode::Leave);
    chunk.write_u32(8);

    CompiledDef {
        owner: TypeId::NULL,
        name: "countdown".into(),
        args_size: 0,
        frame_size: 8,
        return_size: 8,
        takes_self: false,
        chunk,
        block: None,
    }
}

fn bench_dispatch(c: &mut Criterion) {
    let mut context = Context::new(TypeTable::new());
    let def = context.register_def(countdown_def(10_000));
    let mut vm = Interpreter::new(context);

    c.bench_function("countdown_10k", |b| {
        b.iter(|| black_box(vm.execute(def).unwrap()));
    });
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
