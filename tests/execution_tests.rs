//! End-to-end execution tests: hand-assembled bytecode run through the
//! full interpreter, pinning the value layout, call protocol, union
//! semantics, and exception unwinding.

use vesper::{
    Chunk, CompiledBlock, CompiledDef, Context, ExceptionHandler, Inspector, Interpreter, OpCode,
    PrimitiveKind, TypeDescriptor, TypeId, TypeKind, TypeTable, VmError, VmView, WellKnownTypes,
};

// =============================================================================
// Harness
// =============================================================================

/// Type table with the fixtures most tests need.
struct Fixture {
    table: TypeTable,
    int32: TypeId,
    string: TypeId,
    base: TypeId,
    derived: TypeId,
    overflow: TypeId,
}

fn fixture() -> Fixture {
    let mut table = TypeTable::new();
    let int32 = table.register(TypeDescriptor::new(
        "Int32",
        TypeKind::Primitive(PrimitiveKind::I32),
        4,
        4,
    ));
    let string = table.register(TypeDescriptor::new(
        "String",
        TypeKind::Class { parent: None },
        16,
        8,
    ));
    let base = table.register(TypeDescriptor::new(
        "Shape",
        TypeKind::Class { parent: None },
        16,
        8,
    ));
    let derived = table.register(TypeDescriptor::new(
        "Circle",
        TypeKind::Class { parent: Some(base) },
        24,
        8,
    ));
    let overflow = table.register(TypeDescriptor::new(
        "OverflowError",
        TypeKind::Class { parent: None },
        16,
        8,
    ));
    Fixture {
        table,
        int32,
        string,
        base,
        derived,
        overflow,
    }
}

fn context_with(fixture: Fixture) -> Context {
    let mut context = Context::new(fixture.table);
    context.set_well_known(WellKnownTypes {
        overflow_error: Some(fixture.overflow),
        library_error: None,
        out_of_memory_error: None,
    });
    context
}

fn main_def(chunk: Chunk, frame_size: u32, return_size: u32) -> CompiledDef {
    CompiledDef {
        owner: TypeId::NULL,
        name: "main".into(),
        args_size: 0,
        frame_size,
        return_size,
        takes_self: false,
        chunk,
        block: None,
    }
}

/// Register `chunk` as `main` and run it to completion.
fn run_main(mut context: Context, chunk: Chunk, frame_size: u32, return_size: u32) -> Vec<u8> {
    let _ = env_logger::builder().is_test(true).try_init();
    let def = context.register_def(main_def(chunk, frame_size, return_size));
    let mut vm = Interpreter::new(context);
    let out = vm.execute(def).expect("execution failed");
    assert_eq!(vm.stack().sp(), 0, "stack not drained after main returned");
    out
}

fn run_simple(chunk: Chunk, frame_size: u32, return_size: u32) -> Vec<u8> {
    run_main(context_with(fixture()), chunk, frame_size, return_size)
}

fn put_i64(chunk: &mut Chunk, value: i64) {
    chunk.write_op(OpCode::PutI64);
    chunk.write_i64(value);
}

fn leave(chunk: &mut Chunk, size: u32) {
    chunk.write_op(OpCode::Leave);
    chunk.write_u32(size);
}

fn as_i64(bytes: &[u8]) -> i64 {
    i64::from_ne_bytes(bytes.try_into().unwrap())
}

fn as_i32(bytes: &[u8]) -> i32 {
    i32::from_ne_bytes(bytes.try_into().unwrap())
}

fn as_u64(bytes: &[u8]) -> u64 {
    u64::from_ne_bytes(bytes.try_into().unwrap())
}

// =============================================================================
// Arithmetic and Comparisons
// =============================================================================

#[test]
fn subtract_compare_fold() {
    // 7 - 5 == 2
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 7);
    put_i64(&mut chunk, 5);
    chunk.write_op(OpCode::SubI64);
    put_i64(&mut chunk, 2);
    chunk.write_op(OpCode::CmpI64);
    chunk.write_op(OpCode::CmpEq);
    leave(&mut chunk, 1);

    assert_eq!(run_simple(chunk, 0, 1), vec![1]);
}

#[test]
fn wrapping_add_i32_wraps_to_min() {
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 0x7FFF_FFFF);
    put_i64(&mut chunk, 1);
    chunk.write_op(OpCode::AddWrapI32);
    leave(&mut chunk, 4);

    assert_eq!(as_i32(&run_simple(chunk, 0, 4)), i32::MIN);
}

#[test]
fn checked_overflow_raises_catchable_exception() {
    let fx = fixture();
    let overflow = fx.overflow;
    let context = context_with(fx);

    let mut chunk = Chunk::new();
    put_i64(&mut chunk, i64::MAX);
    put_i64(&mut chunk, 1);
    chunk.write_op(OpCode::AddI64);
    leave(&mut chunk, 8);
    let body_end = chunk.current_offset() as u32;
    // Handler: discard the exception reference, produce 7.
    let target = body_end;
    chunk.write_op(OpCode::Pop);
    chunk.write_u32(8);
    put_i64(&mut chunk, 7);
    leave(&mut chunk, 8);
    chunk.add_handler(ExceptionHandler {
        start: 0,
        end: body_end,
        target,
        stack_depth: 0,
        catch_types: vec![overflow],
    });

    assert_eq!(as_i64(&run_main(context, chunk, 0, 8)), 7);
}

#[test]
fn uncaught_overflow_reports_type_and_frame() {
    let mut context = context_with(fixture());
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, i64::MIN);
    put_i64(&mut chunk, 1);
    chunk.write_op(OpCode::SubI64);
    leave(&mut chunk, 8);

    let def = context.register_def(main_def(chunk, 0, 8));
    let mut vm = Interpreter::new(context);
    let err = vm.execute(def).unwrap_err();
    match err {
        VmError::UncaughtException {
            type_name, frame, ..
        } => {
            assert!(type_name.contains("OverflowError"), "{type_name}");
            assert_eq!(frame, "main");
        }
        other => panic!("expected uncaught exception, got {other}"),
    }
}

#[test]
fn non_matching_handler_is_skipped() {
    let fx = fixture();
    let string = fx.string;
    let context = context_with(fx);

    let mut chunk = Chunk::new();
    put_i64(&mut chunk, i64::MAX);
    put_i64(&mut chunk, 1);
    chunk.write_op(OpCode::AddI64);
    leave(&mut chunk, 8);
    let body_end = chunk.current_offset() as u32;
    let target = body_end;
    put_i64(&mut chunk, 0);
    leave(&mut chunk, 8);
    // Catches only String; the overflow must fly past it.
    chunk.add_handler(ExceptionHandler {
        start: 0,
        end: body_end,
        target,
        stack_depth: 0,
        catch_types: vec![string],
    });

    let mut context = context;
    let def = context.register_def(main_def(chunk, 0, 8));
    let mut vm = Interpreter::new(context);
    assert!(matches!(
        vm.execute(def),
        Err(VmError::UncaughtException { .. })
    ));
}

#[test]
fn reraise_rethrows_the_caught_exception() {
    let fx = fixture();
    let overflow = fx.overflow;
    let mut context = context_with(fx);

    let mut chunk = Chunk::new();
    put_i64(&mut chunk, i64::MAX);
    put_i64(&mut chunk, 1);
    chunk.write_op(OpCode::AddI64);
    leave(&mut chunk, 8);
    let body_end = chunk.current_offset() as u32;
    // Handler catches, then rethrows; nothing covers the rethrow.
    let target = body_end;
    chunk.write_op(OpCode::Pop);
    chunk.write_u32(8);
    chunk.write_op(OpCode::Reraise);
    chunk.add_handler(ExceptionHandler {
        start: 0,
        end: body_end,
        target,
        stack_depth: 0,
        catch_types: vec![overflow],
    });

    let def = context.register_def(main_def(chunk, 0, 8));
    let mut vm = Interpreter::new(context);
    match vm.execute(def) {
        Err(VmError::UncaughtException { type_name, .. }) => {
            assert!(type_name.contains("OverflowError"), "{type_name}");
        }
        other => panic!("expected rethrown overflow, got {other:?}"),
    }
}

#[test]
fn unsigned_mixed_compare() {
    // u64::MAX > any negative i64
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, -1); // u64::MAX bit pattern
    put_i64(&mut chunk, -5);
    chunk.write_op(OpCode::CmpU64I64);
    chunk.write_op(OpCode::CmpGt);
    leave(&mut chunk, 1);

    assert_eq!(run_simple(chunk, 0, 1), vec![1]);
}

#[test]
fn float_nan_compares_greater() {
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, f64::NAN.to_bits() as i64);
    put_i64(&mut chunk, 1.0f64.to_bits() as i64);
    chunk.write_op(OpCode::CmpF64);
    leave(&mut chunk, 4);

    assert_eq!(as_i32(&run_simple(chunk, 0, 4)), 1);
}

#[test]
fn float_arithmetic_and_sqrt() {
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 5.0f64.to_bits() as i64);
    put_i64(&mut chunk, 4.0f64.to_bits() as i64);
    chunk.write_op(OpCode::MulF64);
    chunk.write_op(OpCode::SqrtF64);
    leave(&mut chunk, 8);

    let bytes = run_simple(chunk, 0, 8);
    assert_eq!(f64::from_bits(as_u64(&bytes)), 20.0f64.sqrt());
}

#[test]
fn unsafe_division_truncates() {
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, -7);
    put_i64(&mut chunk, 2);
    chunk.write_op(OpCode::UnsafeDivI64);
    leave(&mut chunk, 8);

    assert_eq!(as_i64(&run_simple(chunk, 0, 8)), -3);
}

// =============================================================================
// Conversions
// =============================================================================

#[test]
fn sign_extend_round_trips() {
    // 0xFF as i8 is -1; extending by 7 bytes yields -1 as i64.
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 0xFF);
    chunk.write_op(OpCode::SignExtend);
    chunk.write_u32(7);
    leave(&mut chunk, 8);
    assert_eq!(as_i64(&run_simple(chunk, 0, 8)), -1);

    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 0xFF);
    chunk.write_op(OpCode::ZeroExtend);
    chunk.write_u32(7);
    leave(&mut chunk, 8);
    assert_eq!(as_i64(&run_simple(chunk, 0, 8)), 255);
}

#[test]
fn int_to_float_conversions() {
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, -3);
    chunk.write_op(OpCode::I32ToF64);
    leave(&mut chunk, 8);
    let bytes = run_simple(chunk, 0, 8);
    assert_eq!(f64::from_bits(as_u64(&bytes)), -3.0);

    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 2.75f64.to_bits() as i64);
    chunk.write_op(OpCode::F64ToI64Trunc);
    leave(&mut chunk, 8);
    assert_eq!(as_i64(&run_simple(chunk, 0, 8)), 2);
}

// =============================================================================
// Unions (spec scenarios 3 and 4)
// =============================================================================

#[test]
fn union_wrap_then_filter() {
    let fx = fixture();
    let int32 = fx.int32;
    let string = fx.string;

    for (filter, expected) in [(int32, 1u8), (string, 0u8)] {
        let fx = fixture();
        let context = context_with(fx);
        let mut chunk = Chunk::new();
        put_i64(&mut chunk, 42);
        chunk.write_op(OpCode::PutInUnion);
        chunk.write_u32(int32.index());
        chunk.write_u32(4);
        chunk.write_u32(16);
        chunk.write_op(OpCode::UnionIsA);
        chunk.write_u32(16);
        chunk.write_u32(filter.index());
        leave(&mut chunk, 1);

        assert_eq!(run_main(context, chunk, 0, 1), vec![expected]);
    }
}

#[test]
fn union_unwrap_is_left_inverse_of_wrap() {
    let fx = fixture();
    let int32 = fx.int32;
    let context = context_with(fx);

    let mut chunk = Chunk::new();
    put_i64(&mut chunk, -123456);
    chunk.write_op(OpCode::PutInUnion);
    chunk.write_u32(int32.index());
    chunk.write_u32(4);
    chunk.write_u32(16);
    chunk.write_op(OpCode::RemoveFromUnion);
    chunk.write_u32(16);
    chunk.write_u32(4);
    leave(&mut chunk, 4);

    assert_eq!(as_i32(&run_main(context, chunk, 0, 4)), -123456);
}

#[test]
fn nilable_pointer_truthiness() {
    // Null pointer wraps to the all-zero union, which is falsey.
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 0);
    chunk.write_op(OpCode::PutNilableTypeInUnion);
    chunk.write_u32(16);
    chunk.write_op(OpCode::UnionToBool);
    chunk.write_u32(16);
    leave(&mut chunk, 1);
    assert_eq!(run_simple(chunk, 0, 1), vec![0]);

    // A live reference is truthy.
    let fx = fixture();
    let string = fx.string;
    let context = context_with(fx);
    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::AllocateClass);
    chunk.write_u32(16);
    chunk.write_u32(string.index());
    chunk.write_op(OpCode::PutNilableTypeInUnion);
    chunk.write_u32(16);
    chunk.write_op(OpCode::UnionToBool);
    chunk.write_u32(16);
    leave(&mut chunk, 1);
    assert_eq!(run_main(context, chunk, 0, 1), vec![1]);
}

#[test]
fn reference_union_reads_cell_header() {
    let fx = fixture();
    let derived = fx.derived;
    let base = fx.base;
    let context = context_with(fx);

    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::AllocateClass);
    chunk.write_u32(24);
    chunk.write_u32(derived.index());
    chunk.write_op(OpCode::PutReferenceTypeInUnion);
    chunk.write_u32(16);
    chunk.write_op(OpCode::UnionIsA);
    chunk.write_u32(16);
    chunk.write_u32(base.index());
    leave(&mut chunk, 1);

    assert_eq!(run_main(context, chunk, 0, 1), vec![1]);
}

// =============================================================================
// is_a? filters
// =============================================================================

#[test]
fn reference_is_a_null_is_never_a_subtype() {
    let fx = fixture();
    let string = fx.string;
    let context = context_with(fx);

    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 0);
    chunk.write_op(OpCode::ReferenceIsA);
    chunk.write_u32(string.index());
    leave(&mut chunk, 1);

    assert_eq!(run_main(context, chunk, 0, 1), vec![0]);
}

#[test]
fn union_is_a_nil_header_matches_nothing() {
    let fx = fixture();
    let string = fx.string;
    let context = context_with(fx);

    // An all-zero union (nil payload) is never a subtype.
    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::PushZeros);
    chunk.write_u32(16);
    chunk.write_op(OpCode::UnionIsA);
    chunk.write_u32(16);
    chunk.write_u32(string.index());
    leave(&mut chunk, 1);

    assert_eq!(run_main(context, chunk, 0, 1), vec![0]);
}

#[test]
fn reference_is_a_walks_parents() {
    let fx = fixture();
    let derived = fx.derived;
    let base = fx.base;
    let context = context_with(fx);

    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::AllocateClass);
    chunk.write_u32(24);
    chunk.write_u32(derived.index());
    chunk.write_op(OpCode::ReferenceIsA);
    chunk.write_u32(base.index());
    leave(&mut chunk, 1);

    assert_eq!(run_main(context, chunk, 0, 1), vec![1]);
}

// =============================================================================
// Tuples and aggregates (spec scenario 5)
// =============================================================================

#[test]
fn tuple_indexing_extracts_middle_field() {
    // Tuple (i32, i64, bool): offsets 0, 8, 16; stack footprint 24.
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 7);
    put_i64(&mut chunk, 1 << 40);
    put_i64(&mut chunk, 1);
    chunk.write_op(OpCode::TupleIndexerKnownIndex);
    chunk.write_u32(24);
    chunk.write_u32(8);
    chunk.write_u32(8);
    leave(&mut chunk, 8);

    assert_eq!(as_i64(&run_simple(chunk, 0, 8)), 1 << 40);
}

// =============================================================================
// Calls, locals, and frames
// =============================================================================

#[test]
fn call_copies_args_into_frame() {
    let mut context = context_with(fixture());

    let mut body = Chunk::new();
    body.write_op(OpCode::GetLocal);
    body.write_u32(0);
    body.write_u32(8);
    body.write_op(OpCode::GetLocal);
    body.write_u32(8);
    body.write_u32(8);
    body.write_op(OpCode::SubI64);
    leave(&mut body, 8);
    let sub = context.register_def(CompiledDef {
        owner: TypeId::NULL,
        name: "sub".into(),
        args_size: 16,
        frame_size: 16,
        return_size: 8,
        takes_self: false,
        chunk: body,
        block: None,
    });

    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 44);
    put_i64(&mut chunk, 2);
    chunk.write_op(OpCode::Call);
    chunk.write_u64(sub.index() as u64);
    leave(&mut chunk, 8);

    assert_eq!(as_i64(&run_main(context, chunk, 0, 8)), 42);
}

#[test]
fn locals_and_branching_loop() {
    // sum = 0; i = 0; while i < 5 { sum += i; i += 1 }; sum
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 0);
    chunk.write_op(OpCode::SetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    put_i64(&mut chunk, 0);
    chunk.write_op(OpCode::SetLocal);
    chunk.write_u32(8);
    chunk.write_u32(8);

    let loop_start = chunk.current_offset() as u32;
    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(8);
    chunk.write_u32(8);
    put_i64(&mut chunk, 5);
    chunk.write_op(OpCode::CmpI64);
    chunk.write_op(OpCode::CmpGe);
    let exit_jump = chunk.emit_jump(OpCode::BranchIf);

    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(8);
    chunk.write_u32(8);
    chunk.write_op(OpCode::AddI64);
    chunk.write_op(OpCode::SetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);

    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(8);
    chunk.write_u32(8);
    put_i64(&mut chunk, 1);
    chunk.write_op(OpCode::AddI64);
    chunk.write_op(OpCode::SetLocal);
    chunk.write_u32(8);
    chunk.write_u32(8);
    chunk.write_op(OpCode::Jump);
    chunk.write_u32(loop_start);

    chunk.patch_jump(exit_jump);
    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    leave(&mut chunk, 8);

    assert_eq!(as_i64(&run_simple(chunk, 16, 8)), 10);
}

#[test]
fn stack_manipulation_opcodes() {
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 5);
    chunk.write_op(OpCode::Dup);
    chunk.write_u32(8);
    chunk.write_op(OpCode::AddI64); // 10
    chunk.write_op(OpCode::PushZeros);
    chunk.write_u32(8);
    chunk.write_op(OpCode::Pop);
    chunk.write_u32(8);
    chunk.write_op(OpCode::PutStackTopPointer);
    chunk.write_u32(8);
    chunk.write_op(OpCode::PointerGet);
    chunk.write_u32(8);
    chunk.write_op(OpCode::AddI64); // 20
    leave(&mut chunk, 8);

    assert_eq!(as_i64(&run_simple(chunk, 0, 8)), 20);
}

#[test]
fn pop_from_offset_removes_buried_value() {
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 1);
    put_i64(&mut chunk, 90);
    put_i64(&mut chunk, 3);
    chunk.write_op(OpCode::PopFromOffset);
    chunk.write_u32(8);
    chunk.write_u32(8);
    chunk.write_op(OpCode::AddI64);
    leave(&mut chunk, 8);

    assert_eq!(as_i64(&run_simple(chunk, 0, 8)), 4);
}

// =============================================================================
// Instance variables and heap cells
// =============================================================================

#[test]
fn self_ivar_write_is_visible_through_the_reference() {
    let fx = fixture();
    let base = fx.base;
    let mut context = context_with(fx);

    // Shape#mark: @stamp = 42 (ivar at offset 8)
    let mut body = Chunk::new();
    put_i64(&mut body, 42);
    body.write_op(OpCode::SetSelfIvar);
    body.write_u32(8);
    body.write_u32(8);
    leave(&mut body, 0);
    let mark = context.register_def(CompiledDef {
        owner: base,
        name: "Shape#mark".into(),
        args_size: 8,
        frame_size: 8,
        return_size: 0,
        takes_self: true,
        chunk: body,
        block: None,
    });

    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::AllocateClass);
    chunk.write_u32(16);
    chunk.write_u32(base.index());
    chunk.write_op(OpCode::Dup);
    chunk.write_u32(8);
    chunk.write_op(OpCode::Call);
    chunk.write_u64(mark.index() as u64);
    chunk.write_op(OpCode::GetClassIvar);
    chunk.write_u32(8);
    chunk.write_u32(8);
    leave(&mut chunk, 8);

    assert_eq!(as_i64(&run_main(context, chunk, 0, 8)), 42);
}

#[test]
fn struct_field_extraction() {
    // Struct { a: i64, b: i64 } on the stack; take b.
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 11);
    put_i64(&mut chunk, 22);
    chunk.write_op(OpCode::GetStructIvar);
    chunk.write_u32(8);
    chunk.write_u32(8);
    chunk.write_u32(16);
    leave(&mut chunk, 8);

    assert_eq!(as_i64(&run_simple(chunk, 0, 8)), 22);
}

// =============================================================================
// Pointers
// =============================================================================

#[test]
fn pointer_malloc_set_get() {
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 4);
    chunk.write_op(OpCode::PointerMalloc);
    chunk.write_u32(8);
    chunk.write_op(OpCode::SetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);

    // p[0] = 123
    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    put_i64(&mut chunk, 123);
    chunk.write_op(OpCode::PointerSet);
    chunk.write_u32(8);

    // p[2] = 77
    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    put_i64(&mut chunk, 2);
    chunk.write_op(OpCode::PointerAdd);
    chunk.write_u32(8);
    put_i64(&mut chunk, 77);
    chunk.write_op(OpCode::PointerSet);
    chunk.write_u32(8);

    // p[0] + p[2]
    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    chunk.write_op(OpCode::PointerGet);
    chunk.write_u32(8);
    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    put_i64(&mut chunk, 2);
    chunk.write_op(OpCode::PointerAdd);
    chunk.write_u32(8);
    chunk.write_op(OpCode::PointerGet);
    chunk.write_u32(8);
    chunk.write_op(OpCode::AddI64);
    leave(&mut chunk, 8);

    assert_eq!(as_i64(&run_simple(chunk, 8, 8)), 200);
}

#[test]
fn pointer_diff_inverts_pointer_add() {
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 1);
    chunk.write_op(OpCode::PointerMalloc);
    chunk.write_u32(4);
    chunk.write_op(OpCode::SetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);

    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    put_i64(&mut chunk, 5);
    chunk.write_op(OpCode::PointerAdd);
    chunk.write_u32(4);
    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    chunk.write_op(OpCode::PointerDiff);
    chunk.write_u32(4);
    leave(&mut chunk, 8);

    assert_eq!(as_i64(&run_simple(chunk, 8, 8)), 5);
}

#[test]
fn pointer_null_checks() {
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 0);
    chunk.write_op(OpCode::PointerIsNull);
    leave(&mut chunk, 1);
    assert_eq!(run_simple(chunk, 0, 1), vec![1]);

    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 0);
    chunk.write_op(OpCode::PointerIsNotNull);
    leave(&mut chunk, 1);
    assert_eq!(run_simple(chunk, 0, 1), vec![0]);
}

// =============================================================================
// Constants and class variables
// =============================================================================

#[test]
fn lazy_constant_initialization_protocol() {
    let mut context = context_with(fixture());
    let slot = context.register_const(8);

    // if !const_initialized { const = 99 }; const
    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::ConstInitialized);
    chunk.write_u32(slot);
    let skip = chunk.emit_jump(OpCode::BranchIf);
    put_i64(&mut chunk, 99);
    chunk.write_op(OpCode::SetConst);
    chunk.write_u32(slot);
    chunk.write_u32(8);
    chunk.patch_jump(skip);
    chunk.write_op(OpCode::GetConst);
    chunk.write_u32(slot);
    chunk.write_u32(8);
    leave(&mut chunk, 8);

    assert_eq!(as_i64(&run_main(context, chunk, 0, 8)), 99);
}

#[test]
fn class_var_round_trip() {
    let mut context = context_with(fixture());
    let slot = context.register_class_var(8);

    let mut chunk = Chunk::new();
    put_i64(&mut chunk, -17);
    chunk.write_op(OpCode::SetClassVar);
    chunk.write_u32(slot);
    chunk.write_u32(8);
    chunk.write_op(OpCode::GetClassVar);
    chunk.write_u32(slot);
    chunk.write_u32(8);
    leave(&mut chunk, 8);

    assert_eq!(as_i64(&run_main(context, chunk, 0, 8)), -17);
}

// =============================================================================
// Blocks
// =============================================================================

/// Register a yielder def plus a doubling block bound to `main`'s frame.
fn block_fixture(context: &mut Context, break_instead: bool) -> (u64, u64) {
    // Block: |x| x * 2, parameter landing at main's frame offset 8.
    let mut body = Chunk::new();
    body.write_op(OpCode::GetLocal);
    body.write_u32(8);
    body.write_u32(8);
    put_i64(&mut body, 2);
    body.write_op(OpCode::MulI64);
    if break_instead {
        body.write_op(OpCode::BreakBlock);
        body.write_u32(8);
    } else {
        leave(&mut body, 8);
    }
    let block = context.register_block(CompiledBlock {
        name: "main.block".into(),
        args_size: 8,
        args_offset: 8,
        return_size: 8,
        chunk: body,
        captures: vec![(8, 8)],
    });

    // yielder: (yield 21) + 1
    let mut body = Chunk::new();
    put_i64(&mut body, 21);
    body.write_op(OpCode::CallBlock);
    body.write_u64(block.index() as u64);
    put_i64(&mut body, 1);
    body.write_op(OpCode::AddI64);
    leave(&mut body, 8);
    let yielder = context.register_def(CompiledDef {
        owner: TypeId::NULL,
        name: "yielder".into(),
        args_size: 0,
        frame_size: 0,
        return_size: 8,
        takes_self: false,
        chunk: body,
        block: Some(block),
    });

    (yielder.index() as u64, block.index() as u64)
}

#[test]
fn yield_runs_block_in_definer_frame() {
    let mut context = context_with(fixture());
    let (yielder, block) = block_fixture(&mut context, false);

    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::CallWithBlock);
    chunk.write_u64(yielder);
    chunk.write_u64(block);
    leave(&mut chunk, 8);

    // (21 * 2) + 1
    assert_eq!(as_i64(&run_main(context, chunk, 16, 8)), 43);
}

#[test]
fn break_block_returns_from_the_yielding_def() {
    let mut context = context_with(fixture());
    let (yielder, block) = block_fixture(&mut context, true);

    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::CallWithBlock);
    chunk.write_u64(yielder);
    chunk.write_u64(block);
    leave(&mut chunk, 8);

    // break skips the yielder's +1.
    assert_eq!(as_i64(&run_main(context, chunk, 16, 8)), 42);
}

#[test]
fn leave_def_returns_from_the_lexically_enclosing_def() {
    let mut context = context_with(fixture());

    // Block body: `return 7` -- leaves main itself, not just the yielder.
    let mut body = Chunk::new();
    put_i64(&mut body, 7);
    body.write_op(OpCode::LeaveDef);
    body.write_u32(8);
    let block = context.register_block(CompiledBlock {
        name: "main.block".into(),
        args_size: 8,
        args_offset: 8,
        return_size: 8,
        chunk: body,
        captures: vec![],
    });

    let mut body = Chunk::new();
    put_i64(&mut body, 21);
    body.write_op(OpCode::CallBlock);
    body.write_u64(block.index() as u64);
    put_i64(&mut body, 1);
    body.write_op(OpCode::AddI64);
    leave(&mut body, 8);
    let yielder = context.register_def(CompiledDef {
        owner: TypeId::NULL,
        name: "yielder".into(),
        args_size: 0,
        frame_size: 0,
        return_size: 8,
        takes_self: false,
        chunk: body,
        block: Some(block),
    });

    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::CallWithBlock);
    chunk.write_u64(yielder.index() as u64);
    chunk.write_u64(block.index() as u64);
    put_i64(&mut chunk, 1000);
    chunk.write_op(OpCode::AddI64);
    leave(&mut chunk, 8);

    // Neither the yielder's +1 nor main's +1000 runs.
    assert_eq!(as_i64(&run_main(context, chunk, 16, 8)), 7);
}

// =============================================================================
// Procs
// =============================================================================

#[test]
fn proc_call_invokes_the_bound_def() {
    let mut context = context_with(fixture());

    let mut body = Chunk::new();
    body.write_op(OpCode::GetLocal);
    body.write_u32(0);
    body.write_u32(8);
    put_i64(&mut body, 1);
    body.write_op(OpCode::AddI64);
    leave(&mut body, 8);
    let succ = context.register_def(CompiledDef {
        owner: TypeId::NULL,
        name: "succ".into(),
        args_size: 8,
        frame_size: 8,
        return_size: 8,
        takes_self: false,
        chunk: body,
        block: None,
    });

    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 41); // argument
    put_i64(&mut chunk, succ.index() as i64); // proc: def index
    put_i64(&mut chunk, 0); // proc: no closure data
    chunk.write_op(OpCode::ProcCall);
    leave(&mut chunk, 8);

    assert_eq!(as_i64(&run_main(context, chunk, 0, 8)), 42);
}

#[test]
fn proc_call_appends_closure_data() {
    let mut context = context_with(fixture());

    // The closure-data word arrives as the trailing argument.
    let mut body = Chunk::new();
    body.write_op(OpCode::GetLocal);
    body.write_u32(0);
    body.write_u32(8);
    leave(&mut body, 8);
    let grab = context.register_def(CompiledDef {
        owner: TypeId::NULL,
        name: "grab_closure".into(),
        args_size: 8,
        frame_size: 8,
        return_size: 8,
        takes_self: false,
        chunk: body,
        block: None,
    });

    let mut chunk = Chunk::new();
    put_i64(&mut chunk, grab.index() as i64);
    put_i64(&mut chunk, 0xBEEF);
    chunk.write_op(OpCode::ProcCall);
    leave(&mut chunk, 8);

    assert_eq!(as_i64(&run_main(context, chunk, 0, 8)), 0xBEEF);
}

// =============================================================================
// Atomics
// =============================================================================

#[test]
fn atomic_store_rmw_load() {
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 1);
    chunk.write_op(OpCode::PointerMalloc);
    chunk.write_u32(8);
    chunk.write_op(OpCode::SetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);

    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    put_i64(&mut chunk, 5);
    chunk.write_op(OpCode::StoreAtomic);
    chunk.write_u32(8);
    chunk.write_u8(0);

    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    put_i64(&mut chunk, 3);
    chunk.write_op(OpCode::AtomicRmw);
    chunk.write_u8(0); // add
    chunk.write_u32(8);
    chunk.write_u8(0);
    chunk.write_op(OpCode::Pop); // previous value (5)
    chunk.write_u32(8);

    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    chunk.write_op(OpCode::LoadAtomic);
    chunk.write_u32(8);
    chunk.write_u8(0);
    leave(&mut chunk, 8);

    assert_eq!(as_i64(&run_simple(chunk, 8, 8)), 8);
}

#[test]
fn cmpxchg_reports_previous_value_and_outcome() {
    for (expected, should_succeed) in [(10i64, 1u8), (5, 0)] {
        let mut chunk = Chunk::new();
        put_i64(&mut chunk, 1);
        chunk.write_op(OpCode::PointerMalloc);
        chunk.write_u32(8);
        chunk.write_op(OpCode::SetLocal);
        chunk.write_u32(0);
        chunk.write_u32(8);

        chunk.write_op(OpCode::GetLocal);
        chunk.write_u32(0);
        chunk.write_u32(8);
        put_i64(&mut chunk, 10);
        chunk.write_op(OpCode::StoreAtomic);
        chunk.write_u32(8);
        chunk.write_u8(0);

        chunk.write_op(OpCode::GetLocal);
        chunk.write_u32(0);
        chunk.write_u32(8);
        put_i64(&mut chunk, expected);
        put_i64(&mut chunk, 99);
        chunk.write_op(OpCode::CmpXchg);
        chunk.write_u32(8);
        chunk.write_u8(0);
        chunk.write_u8(0);
        leave(&mut chunk, 16);

        let bytes = run_simple(chunk, 8, 16);
        assert_eq!(as_i64(&bytes[..8]), 10, "previous value");
        assert_eq!(bytes[8], should_succeed, "success flag");
    }
}

// =============================================================================
// Intrinsics
// =============================================================================

#[test]
fn bit_intrinsics() {
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 0x0102_0304_0506_0708);
    chunk.write_op(OpCode::ByteSwap);
    chunk.write_u32(8);
    leave(&mut chunk, 8);
    assert_eq!(as_u64(&run_simple(chunk, 0, 8)), 0x0807_0605_0403_0201);

    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 0xF0F0);
    chunk.write_op(OpCode::PopCount);
    chunk.write_u32(8);
    leave(&mut chunk, 4);
    assert_eq!(as_i32(&run_simple(chunk, 0, 4)), 8);

    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 16);
    chunk.write_op(OpCode::TrailingZeros);
    chunk.write_u32(8);
    leave(&mut chunk, 4);
    assert_eq!(as_i32(&run_simple(chunk, 0, 4)), 4);
}

#[test]
fn memset_fills_allocation() {
    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 2);
    chunk.write_op(OpCode::PointerMalloc);
    chunk.write_u32(8);
    chunk.write_op(OpCode::SetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);

    // memset(p, 0xAB, 16, volatile: false)
    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    put_i64(&mut chunk, 0xAB);
    put_i64(&mut chunk, 16);
    put_i64(&mut chunk, 0);
    chunk.write_op(OpCode::MemSet);

    chunk.write_op(OpCode::GetLocal);
    chunk.write_u32(0);
    chunk.write_u32(8);
    chunk.write_op(OpCode::PointerGet);
    chunk.write_u32(8);
    leave(&mut chunk, 8);

    assert_eq!(as_u64(&run_simple(chunk, 8, 8)), 0xABAB_ABAB_ABAB_ABAB);
}

#[test]
fn cycle_counter_executes() {
    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::ReadCycleCounter);
    chunk.write_op(OpCode::Pop);
    chunk.write_u32(8);
    chunk.write_op(OpCode::CpuPause);
    put_i64(&mut chunk, 1);
    leave(&mut chunk, 8);

    assert_eq!(as_i64(&run_simple(chunk, 0, 8)), 1);
}

// =============================================================================
// Symbols, ARGV, diagnostics
// =============================================================================

#[test]
fn symbol_to_s_pushes_interned_buffer() {
    let mut context = context_with(fixture());
    let sym = context.intern("request_id");

    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::SymbolToS);
    chunk.write_u64(sym.index() as u64);
    leave(&mut chunk, 8);

    let bytes = run_main(context, chunk, 0, 8);
    let ptr = as_u64(&bytes) as *const u8;
    let len = unsafe { (ptr as *const u32).read_unaligned() } as usize;
    let text = unsafe { std::slice::from_raw_parts(ptr.add(4), len) };
    assert_eq!(text, b"request_id");
}

#[test]
fn argc_and_argv() {
    let mut context = context_with(fixture());
    context.set_args(["vesper".to_string(), "eval".to_string()]);

    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::PutArgc);
    leave(&mut chunk, 4);
    assert_eq!(as_i32(&run_main(context, chunk, 0, 4)), 2);

    let mut context = context_with(fixture());
    context.set_args(["vesper".to_string(), "eval".to_string()]);
    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::PutArgv);
    leave(&mut chunk, 8);
    let bytes = run_main(context, chunk, 0, 8);
    let argv = as_u64(&bytes) as *const *const std::ffi::c_char;
    let first = unsafe { std::ffi::CStr::from_ptr(*argv) };
    assert_eq!(first.to_str().unwrap(), "vesper");
}

#[test]
fn unreachable_is_fatal() {
    let mut context = context_with(fixture());
    let sym = context.intern("type filter proven exhaustive");

    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::Unreachable);
    chunk.write_u64(sym.index() as u64);

    let def = context.register_def(main_def(chunk, 0, 0));
    let mut vm = Interpreter::new(context);
    match vm.execute(def) {
        Err(VmError::Unreachable(msg)) => {
            assert_eq!(msg, "type filter proven exhaustive");
        }
        other => panic!("expected unreachable, got {other:?}"),
    }
}

#[test]
fn call_stack_unwind_captures_frames() {
    let mut context = context_with(fixture());

    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::CallStackUnwind);
    leave(&mut chunk, 8);
    let def = context.register_def(main_def(chunk, 0, 8));
    let mut vm = Interpreter::new(context);
    let bytes = vm.execute(def).unwrap();
    let record = as_u64(&bytes) as *const u64;
    unsafe {
        assert_eq!(record.read(), 1, "one frame live at capture");
        assert_eq!(record.add(1).read(), def.index() as u64);
    }
}

#[test]
fn debug_trap_suspends_into_inspector() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe(Arc<AtomicUsize>);
    impl Inspector for Probe {
        fn trap(&mut self, view: &VmView<'_>) {
            assert_eq!(view.location, "main");
            assert_eq!(view.frames.len(), 1);
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    let mut context = context_with(fixture());
    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::DebugTrap);
    put_i64(&mut chunk, 1);
    leave(&mut chunk, 8);
    let def = context.register_def(main_def(chunk, 0, 8));

    let hits = Arc::new(AtomicUsize::new(0));
    let mut vm = Interpreter::new(context);
    vm.set_inspector(Box::new(Probe(hits.clone())));
    assert_eq!(as_i64(&vm.execute(def).unwrap()), 1);
    assert_eq!(hits.load(Ordering::Relaxed), 1);
}

// =============================================================================
// Fibers
// =============================================================================

#[test]
fn spawned_fiber_runs_until_it_swaps_back() {
    let mut context = context_with(fixture());
    let slot = context.register_class_var(8);

    // Fiber body: @@mailbox = 7; swap back to main.
    let mut body = Chunk::new();
    put_i64(&mut body, 7);
    body.write_op(OpCode::SetClassVar);
    body.write_u32(slot);
    body.write_u32(8);
    put_i64(&mut body, 1); // from: this fiber
    put_i64(&mut body, 0); // to: main
    body.write_op(OpCode::FiberSwapcontext);
    leave(&mut body, 0);
    let entry = context.register_def(CompiledDef {
        owner: TypeId::NULL,
        name: "fiber_entry".into(),
        args_size: 0,
        frame_size: 0,
        return_size: 0,
        takes_self: false,
        chunk: body,
        block: None,
    });

    let mut chunk = Chunk::new();
    put_i64(&mut chunk, 1); // fiber handle
    put_i64(&mut chunk, entry.index() as i64);
    put_i64(&mut chunk, 0); // no closure data
    chunk.write_op(OpCode::SpawnFiber);
    chunk.write_op(OpCode::CurrentFiber);
    chunk.write_op(OpCode::Pop);
    chunk.write_u32(8);
    put_i64(&mut chunk, 0); // from: main
    put_i64(&mut chunk, 1); // to: the new fiber
    chunk.write_op(OpCode::FiberSwapcontext);
    chunk.write_op(OpCode::GetClassVar);
    chunk.write_u32(slot);
    chunk.write_u32(8);
    leave(&mut chunk, 8);

    assert_eq!(as_i64(&run_main(context, chunk, 0, 8)), 7);
}
