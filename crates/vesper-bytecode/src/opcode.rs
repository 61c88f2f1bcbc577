//! Bytecode operation codes.
//!
//! This module is the instruction set's source of truth: one enum entry
//! per opcode, with its inline operand layout ([`OpCode::operand_widths`])
//! and disassembly name ([`OpCode::name`]) kept as literal data. The
//! emitter, the executor, and the disassembler all index off this table.
//!
//! Every instruction is one opcode byte followed by its inline operands,
//! encoded little-endian: sizes, offsets, type ids, and branch targets are
//! 4 bytes; side-table indices (defs, blocks, lib functions, call
//! interfaces) and the `put_i64` literal are 8 bytes; atomic-ordering and
//! rmw-operation selectors are 1 byte.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Bytecode operation codes.
///
/// The VM is a stack-based machine over a byte-addressed operand stack.
/// Implicit stack inputs are popped in reverse push order; at most one
/// result is pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    // =========================================================================
    // Literals
    // =========================================================================
    /// Push nil. Nil occupies zero bytes, so this pushes nothing.
    PutNil = 0,
    /// Push a 64-bit literal. Wider literals are emitted as push sequences.
    /// Operand: i64 value
    PutI64,

    // =========================================================================
    // Numeric Conversions
    // =========================================================================
    /// Convert i8 to f32.
    I8ToF32,
    /// Convert i8 to f64.
    I8ToF64,
    /// Convert i16 to f32.
    I16ToF32,
    /// Convert i16 to f64.
    I16ToF64,
    /// Convert i32 to f32.
    I32ToF32,
    /// Convert i32 to f64.
    I32ToF64,
    /// Convert i64 to f32.
    I64ToF32,
    /// Convert i64 to f64.
    I64ToF64,
    /// Convert u8 to f32.
    U8ToF32,
    /// Convert u8 to f64.
    U8ToF64,
    /// Convert u16 to f32.
    U16ToF32,
    /// Convert u16 to f64.
    U16ToF64,
    /// Convert u32 to f32.
    U32ToF32,
    /// Convert u32 to f64.
    U32ToF64,
    /// Convert u64 to f32.
    U64ToF32,
    /// Convert u64 to f64.
    U64ToF64,
    /// Widen f32 to f64.
    F32ToF64,
    /// Narrow f64 to f32.
    F64ToF32,
    /// Truncate f64 to i64, wrapping on overflow.
    F64ToI64Trunc,
    /// Widen the top value by N bytes, filling with the sign bit.
    /// Operand: u32 byte count
    SignExtend,
    /// Widen the top value by N bytes, filling with zeros.
    /// Operand: u32 byte count
    ZeroExtend,

    // =========================================================================
    // Integer Arithmetic (checked; raises OverflowError)
    // =========================================================================
    /// Add two i32 values, raising on overflow.
    AddI32,
    /// Subtract two i32 values, raising on overflow.
    SubI32,
    /// Multiply two i32 values, raising on overflow.
    MulI32,
    /// Add two u32 values, raising on overflow.
    AddU32,
    /// Subtract two u32 values, raising on overflow.
    SubU32,
    /// Multiply two u32 values, raising on overflow.
    MulU32,
    /// Add two i64 values, raising on overflow.
    AddI64,
    /// Subtract two i64 values, raising on overflow.
    SubI64,
    /// Multiply two i64 values, raising on overflow.
    MulI64,
    /// Add two u64 values, raising on overflow.
    AddU64,
    /// Subtract two u64 values, raising on overflow.
    SubU64,
    /// Multiply two u64 values, raising on overflow.
    MulU64,
    /// Add an i64 to a u64, raising when the result leaves u64.
    AddU64I64,
    /// Subtract an i64 from a u64, raising when the result leaves u64.
    SubU64I64,
    /// Multiply a u64 by an i64, raising when the result leaves u64.
    MulU64I64,

    // =========================================================================
    // Integer Arithmetic (two's-complement wrap; never raises)
    // =========================================================================
    /// Wrapping 32-bit add. Sign-agnostic: same bits for i32 and u32.
    AddWrapI32,
    /// Wrapping 32-bit subtract.
    SubWrapI32,
    /// Wrapping 32-bit multiply.
    MulWrapI32,
    /// Wrapping 64-bit add.
    AddWrapI64,
    /// Wrapping 64-bit subtract.
    SubWrapI64,
    /// Wrapping 64-bit multiply.
    MulWrapI64,

    // =========================================================================
    // Float Arithmetic (IEEE 754)
    // =========================================================================
    /// Add two f32 values.
    AddF32,
    /// Subtract two f32 values.
    SubF32,
    /// Multiply two f32 values.
    MulF32,
    /// Divide two f32 values.
    DivF32,
    /// Add two f64 values.
    AddF64,
    /// Subtract two f64 values.
    SubF64,
    /// Multiply two f64 values.
    MulF64,
    /// Divide two f64 values.
    DivF64,

    // =========================================================================
    // Unchecked Division (guards emitted by the compiler)
    // =========================================================================
    /// Raw i32 division. Undefined on zero divisor and INT_MIN / -1.
    UnsafeDivI32,
    /// Raw u32 division. Undefined on zero divisor.
    UnsafeDivU32,
    /// Raw i64 division. Undefined on zero divisor and INT_MIN / -1.
    UnsafeDivI64,
    /// Raw u64 division. Undefined on zero divisor.
    UnsafeDivU64,
    /// Raw i32 remainder.
    UnsafeModI32,
    /// Raw u32 remainder.
    UnsafeModU32,
    /// Raw i64 remainder.
    UnsafeModI64,
    /// Raw u64 remainder.
    UnsafeModU64,

    // =========================================================================
    // Comparisons
    // =========================================================================
    /// Compare two i32 values; push -1/0/+1 as i32.
    CmpI32,
    /// Compare two u32 values; push -1/0/+1 as i32.
    CmpU32,
    /// Compare two i64 values; push -1/0/+1 as i32.
    CmpI64,
    /// Compare two u64 values; push -1/0/+1 as i32.
    CmpU64,
    /// Compare a u64 against an i64; push -1/0/+1 as i32.
    CmpU64I64,
    /// Compare an i64 against a u64; push -1/0/+1 as i32.
    CmpI64U64,
    /// Compare two f32 values; push -1/0/+1 as i32. NaN compares as +1.
    CmpF32,
    /// Compare two f64 values; push -1/0/+1 as i32. NaN compares as +1.
    CmpF64,
    /// Fold a tri-state comparison into `== 0`.
    CmpEq,
    /// Fold a tri-state comparison into `!= 0`.
    CmpNeq,
    /// Fold a tri-state comparison into `< 0`.
    CmpLt,
    /// Fold a tri-state comparison into `<= 0`.
    CmpLe,
    /// Fold a tri-state comparison into `> 0`.
    CmpGt,
    /// Fold a tri-state comparison into `>= 0`.
    CmpGe,

    // =========================================================================
    // Pointers
    // =========================================================================
    /// Pop an element count (i64), allocate `count * elem_size` zeroed
    /// bytes from the host allocator, push the pointer.
    /// Operand: u32 element size
    PointerMalloc,
    /// Pop a new element count (i64) and a pointer; reallocate and push
    /// the (possibly moved) pointer.
    /// Operand: u32 element size
    PointerRealloc,
    /// Pop a value of `elem_size` bytes and a pointer; store the value.
    /// Operand: u32 element size
    PointerSet,
    /// Pop a pointer; push `elem_size` bytes read from it.
    /// Operand: u32 element size
    PointerGet,
    /// Reinterpret the top i64 address as a pointer.
    PointerNew,
    /// Reinterpret the top pointer as an i64 address.
    PointerAddress,
    /// Pop an offset (i64) and a pointer; push `ptr + offset * elem_size`.
    /// Operand: u32 element size
    PointerAdd,
    /// Pop two pointers; push their byte difference divided by
    /// `elem_size` (floor division) as i64.
    /// Operand: u32 element size
    PointerDiff,
    /// Pop a pointer; push whether it is null.
    PointerIsNull,
    /// Pop a pointer; push whether it is not null.
    PointerIsNotNull,

    // =========================================================================
    // Local Variables
    // =========================================================================
    /// Pop `size` bytes and store them at the frame offset.
    /// Operands: u32 frame offset, u32 size
    SetLocal,
    /// Push `size` bytes read from the frame offset.
    /// Operands: u32 frame offset, u32 size
    GetLocal,

    // =========================================================================
    // Instance Variables
    // =========================================================================
    /// Push `size` bytes read through the frame's `self` pointer.
    /// Operands: u32 ivar offset, u32 size
    GetSelfIvar,
    /// Pop `size` bytes and write them through the frame's `self` pointer.
    /// Operands: u32 ivar offset, u32 size
    SetSelfIvar,
    /// Pop a receiver pointer; push `size` bytes read at the offset.
    /// Operands: u32 ivar offset, u32 size
    GetClassIvar,
    /// Extract a field from an aggregate on the stack, shrinking the
    /// aggregate's footprint down to the field's.
    /// Operands: u32 field offset, u32 field size, u32 aggregate size
    GetStructIvar,

    // =========================================================================
    // Constants and Class Variables
    // =========================================================================
    /// Push the constant's initialized flag and set it.
    /// Operand: u32 constant index
    ConstInitialized,
    /// Push `size` bytes from the constant slot.
    /// Operands: u32 constant index, u32 size
    GetConst,
    /// Pop `size` bytes into the constant slot.
    /// Operands: u32 constant index, u32 size
    SetConst,
    /// Push the class variable's initialized flag and set it.
    /// Operand: u32 class-var index
    ClassVarInitialized,
    /// Push `size` bytes from the class-var slot.
    /// Operands: u32 class-var index, u32 size
    GetClassVar,
    /// Pop `size` bytes into the class-var slot.
    /// Operands: u32 class-var index, u32 size
    SetClassVar,

    // =========================================================================
    // Stack Manipulation
    // =========================================================================
    /// Discard the top `size` bytes.
    /// Operand: u32 size
    Pop,
    /// Remove `size` bytes lying `offset` bytes below the top.
    /// Operands: u32 size, u32 offset
    PopFromOffset,
    /// Duplicate the top `size` bytes.
    /// Operand: u32 size
    Dup,
    /// Push `amount` zero bytes.
    /// Operand: u32 amount
    PushZeros,
    /// Push a pointer to the top `size` bytes (pass-by-reference into
    /// inline operations).
    /// Operand: u32 size
    PutStackTopPointer,

    // =========================================================================
    // Control Flow
    // =========================================================================
    /// Pop a bool; jump to the absolute offset when true.
    /// Operand: u32 target
    BranchIf,
    /// Pop a bool; jump to the absolute offset when false.
    /// Operand: u32 target
    BranchUnless,
    /// Unconditional jump to the absolute offset.
    /// Operand: u32 target
    Jump,

    // =========================================================================
    // Calls and Returns
    // =========================================================================
    /// Call a compiled def. Arguments were pushed left to right.
    /// Operand: u64 def index
    Call,
    /// Call a compiled def with a block bound for its yields.
    /// Operands: u64 def index, u64 block index
    CallWithBlock,
    /// Enter the block bound by the enclosing call.
    /// Operand: u64 block index
    CallBlock,
    /// Call a C function through its libffi interface.
    /// Operand: u64 lib-function index
    LibCall,
    /// Return: copy the top `size` bytes over the current frame.
    /// Operand: u32 return size
    Leave,
    /// Return from the lexically enclosing def, closing open blocks.
    /// Operand: u32 return size
    LeaveDef,
    /// Unwind past block frames and return from the yielding def.
    /// Operand: u32 return size
    BreakBlock,

    // =========================================================================
    // Allocation
    // =========================================================================
    /// Allocate a zeroed heap cell and write the type id at offset 0.
    /// Operands: u32 cell size, u32 type id
    AllocateClass,

    // =========================================================================
    // Unions
    // =========================================================================
    /// Wrap the top `from` bytes into a union: shift them up one word,
    /// write the type-id header, zero the tail.
    /// Operands: u32 type id, u32 payload size, u32 union size
    PutInUnion,
    /// Wrap the top reference into a union, reading the type id from the
    /// pointed-to cell (0 when null).
    /// Operand: u32 union size
    PutReferenceTypeInUnion,
    /// Wrap a possibly-null pointer: null becomes the all-zero union,
    /// otherwise header and pointer are stored.
    /// Operand: u32 union size
    PutNilableTypeInUnion,
    /// Unwrap a union known to hold a `from`-sized member.
    /// Operands: u32 union size, u32 payload size
    RemoveFromUnion,
    /// Pop a union; push the truthiness of its dynamic value
    /// (nil, false, and null pointers are falsey).
    /// Operand: u32 union size
    UnionToBool,

    // =========================================================================
    // Type Filters
    // =========================================================================
    /// Pop a reference; push whether its dynamic type is a subtype of the
    /// filter. Null is never a subtype.
    /// Operand: u32 filter type id
    ReferenceIsA,
    /// Pop a union; push whether its header names a subtype of the filter.
    /// Operands: u32 union size, u32 filter type id
    UnionIsA,

    // =========================================================================
    // Tuples
    // =========================================================================
    /// Extract a fixed-position tuple element, shrinking the tuple's
    /// footprint down to the element's.
    /// Operands: u32 tuple size, u32 element offset, u32 element size
    TupleIndexerKnownIndex,

    // =========================================================================
    // Symbols
    // =========================================================================
    /// Push a pointer to the interned, length-prefixed string for a symbol.
    /// Operand: u64 symbol index
    SymbolToS,

    // =========================================================================
    // Procs
    // =========================================================================
    /// Pop a proc value `(def index, closure data)` and call it; non-null
    /// closure data is pushed as the trailing argument.
    ProcCall,
    /// Pop a proc value; build a C-callable libffi closure around it and
    /// push the code pointer.
    /// Operand: u64 call-interface index
    ProcToCFun,
    /// Pop a code pointer previously produced by `proc_to_c_fun`; push the
    /// proc value it was built from.
    CFunToProc,

    // =========================================================================
    // Atomics (orderings accepted but executed sequentially consistent)
    // =========================================================================
    /// Pop a pointer; atomically load `elem_size` bytes.
    /// Operands: u32 element size, u8 ordering
    LoadAtomic,
    /// Pop a value and a pointer; atomically store.
    /// Operands: u32 element size, u8 ordering
    StoreAtomic,
    /// Pop a value and a pointer; apply a read-modify-write operation and
    /// push the previous value.
    /// Operands: u8 rmw operation, u32 element size, u8 ordering
    AtomicRmw,
    /// Pop desired, expected, and a pointer; compare-exchange. Pushes the
    /// previous value then a success bool.
    /// Operands: u32 element size, u8 success ordering, u8 failure ordering
    CmpXchg,

    // =========================================================================
    // Fibers
    // =========================================================================
    /// Push the handle of the running fiber.
    CurrentFiber,
    /// Pop a proc value and a fiber handle; register the fiber with the
    /// host, ready to run the proc.
    SpawnFiber,
    /// Pop two fiber handles; save this fiber's VM registers and resume
    /// the target's.
    FiberSwapcontext,

    // =========================================================================
    // Exceptions
    // =========================================================================
    /// Pop an exception reference and unwind to the nearest matching
    /// handler.
    RaiseWithoutBacktrace,
    /// Rethrow the last caught exception.
    Reraise,
    /// Capture the current frame walk as a heap record; push its address.
    CallStackUnwind,

    // =========================================================================
    // Bit Intrinsics
    // =========================================================================
    /// Reverse the bytes of the top value.
    /// Operand: u32 width in bytes (2, 4, or 8)
    ByteSwap,
    /// Count one bits; push i32.
    /// Operand: u32 width in bytes
    PopCount,
    /// Count leading zero bits; push i32.
    /// Operand: u32 width in bytes
    LeadingZeros,
    /// Count trailing zero bits; push i32.
    /// Operand: u32 width in bytes
    TrailingZeros,

    // =========================================================================
    // Machine Intrinsics
    // =========================================================================
    /// Push the CPU cycle counter as u64.
    ReadCycleCounter,
    /// Spin-loop hint.
    CpuPause,
    /// Suspend into the registered inspector, resuming on its return.
    DebugTrap,
    /// Pop volatile flag, count, source, and destination; copy
    /// non-overlapping bytes.
    MemCopy,
    /// Pop volatile flag, count, source, and destination; copy possibly
    /// overlapping bytes.
    MemMove,
    /// Pop volatile flag, count, fill byte, and destination; fill bytes.
    MemSet,

    // =========================================================================
    // Math Library
    // =========================================================================
    /// f32 ceiling.
    CeilF32,
    /// f64 ceiling.
    CeilF64,
    /// f32 cosine.
    CosF32,
    /// f64 cosine.
    CosF64,
    /// f32 exponential.
    ExpF32,
    /// f64 exponential.
    ExpF64,
    /// f32 floor.
    FloorF32,
    /// f64 floor.
    FloorF64,
    /// f32 natural logarithm.
    LogF32,
    /// f64 natural logarithm.
    LogF64,
    /// f32 round half away from zero.
    RoundF32,
    /// f64 round half away from zero.
    RoundF64,
    /// f32 round to nearest even.
    RintF32,
    /// f64 round to nearest even.
    RintF64,
    /// f32 sine.
    SinF32,
    /// f64 sine.
    SinF64,
    /// f32 square root.
    SqrtF32,
    /// f64 square root.
    SqrtF64,
    /// f32 truncation toward zero.
    TruncF32,
    /// f64 truncation toward zero.
    TruncF64,
    /// f32 power.
    PowF32,
    /// f64 power.
    PowF64,
    /// f32 raised to an i32 power.
    PowiF32,
    /// f64 raised to an i32 power.
    PowiF64,
    /// f32 minimum (IEEE minNum).
    MinF32,
    /// f64 minimum (IEEE minNum).
    MinF64,
    /// f32 maximum (IEEE maxNum).
    MaxF32,
    /// f64 maximum (IEEE maxNum).
    MaxF64,
    /// f32 copysign.
    CopysignF32,
    /// f64 copysign.
    CopysignF64,

    // =========================================================================
    // Process Arguments
    // =========================================================================
    /// Push the process argument count as i32.
    PutArgc,
    /// Push the process argument vector as a C `char**`.
    PutArgv,

    // =========================================================================
    // Diagnostics
    // =========================================================================
    /// Abort with a fatal interpreter error carrying the given message.
    /// Operand: u64 message symbol index
    Unreachable,
}

impl OpCode {
    /// Inline operand widths in bytes, in operand order.
    ///
    /// The sum is the instruction length minus the opcode byte; see
    /// [`OpCode::operand_size`].
    pub fn operand_widths(&self) -> &'static [u8] {
        match self {
            // 64-bit literal / side-table index
            OpCode::PutI64
            | OpCode::Call
            | OpCode::CallBlock
            | OpCode::LibCall
            | OpCode::ProcToCFun
            | OpCode::SymbolToS
            | OpCode::Unreachable => &[8],

            // def index + block index
            OpCode::CallWithBlock => &[8, 8],

            // single 32-bit size / offset / id / target
            OpCode::SignExtend
            | OpCode::ZeroExtend
            | OpCode::PointerMalloc
            | OpCode::PointerRealloc
            | OpCode::PointerSet
            | OpCode::PointerGet
            | OpCode::PointerAdd
            | OpCode::PointerDiff
            | OpCode::ConstInitialized
            | OpCode::ClassVarInitialized
            | OpCode::Pop
            | OpCode::Dup
            | OpCode::PushZeros
            | OpCode::PutStackTopPointer
            | OpCode::BranchIf
            | OpCode::BranchUnless
            | OpCode::Jump
            | OpCode::Leave
            | OpCode::LeaveDef
            | OpCode::BreakBlock
            | OpCode::PutReferenceTypeInUnion
            | OpCode::PutNilableTypeInUnion
            | OpCode::UnionToBool
            | OpCode::ReferenceIsA
            | OpCode::ByteSwap
            | OpCode::PopCount
            | OpCode::LeadingZeros
            | OpCode::TrailingZeros => &[4],

            // two 32-bit operands
            OpCode::SetLocal
            | OpCode::GetLocal
            | OpCode::GetSelfIvar
            | OpCode::SetSelfIvar
            | OpCode::GetClassIvar
            | OpCode::GetConst
            | OpCode::SetConst
            | OpCode::GetClassVar
            | OpCode::SetClassVar
            | OpCode::PopFromOffset
            | OpCode::AllocateClass
            | OpCode::RemoveFromUnion
            | OpCode::UnionIsA => &[4, 4],

            // three 32-bit operands
            OpCode::GetStructIvar
            | OpCode::PutInUnion
            | OpCode::TupleIndexerKnownIndex => &[4, 4, 4],

            // atomics carry ordering selectors
            OpCode::LoadAtomic | OpCode::StoreAtomic => &[4, 1],
            OpCode::AtomicRmw => &[1, 4, 1],
            OpCode::CmpXchg => &[4, 1, 1],

            // everything else is stack-only
            _ => &[],
        }
    }

    /// Total size of this opcode's inline operands in bytes.
    ///
    /// This does NOT include the opcode byte itself.
    pub fn operand_size(&self) -> usize {
        self.operand_widths().iter().map(|&w| w as usize).sum()
    }

    /// Get the name of this opcode for disassembly and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            OpCode::PutNil => "put_nil",
            OpCode::PutI64 => "put_i64",
            OpCode::I8ToF32 => "i8_to_f32",
            OpCode::I8ToF64 => "i8_to_f64",
            OpCode::I16ToF32 => "i16_to_f32",
            OpCode::I16ToF64 => "i16_to_f64",
            OpCode::I32ToF32 => "i32_to_f32",
            OpCode::I32ToF64 => "i32_to_f64",
            OpCode::I64ToF32 => "i64_to_f32",
            OpCode::I64ToF64 => "i64_to_f64",
            OpCode::U8ToF32 => "u8_to_f32",
            OpCode::U8ToF64 => "u8_to_f64",
            OpCode::U16ToF32 => "u16_to_f32",
            OpCode::U16ToF64 => "u16_to_f64",
            OpCode::U32ToF32 => "u32_to_f32",
            OpCode::U32ToF64 => "u32_to_f64",
            OpCode::U64ToF32 => "u64_to_f32",
            OpCode::U64ToF64 => "u64_to_f64",
            OpCode::F32ToF64 => "f32_to_f64",
            OpCode::F64ToF32 => "f64_to_f32",
            OpCode::F64ToI64Trunc => "f64_to_i64_trunc",
            OpCode::SignExtend => "sign_extend",
            OpCode::ZeroExtend => "zero_extend",
            OpCode::AddI32 => "add_i32",
            OpCode::SubI32 => "sub_i32",
            OpCode::MulI32 => "mul_i32",
            OpCode::AddU32 => "add_u32",
            OpCode::SubU32 => "sub_u32",
            OpCode::MulU32 => "mul_u32",
            OpCode::AddI64 => "add_i64",
            OpCode::SubI64 => "sub_i64",
            OpCode::MulI64 => "mul_i64",
            OpCode::AddU64 => "add_u64",
            OpCode::SubU64 => "sub_u64",
            OpCode::MulU64 => "mul_u64",
            OpCode::AddU64I64 => "add_u64_i64",
            OpCode::SubU64I64 => "sub_u64_i64",
            OpCode::MulU64I64 => "mul_u64_i64",
            OpCode::AddWrapI32 => "add_wrap_i32",
            OpCode::SubWrapI32 => "sub_wrap_i32",
            OpCode::MulWrapI32 => "mul_wrap_i32",
            OpCode::AddWrapI64 => "add_wrap_i64",
            OpCode::SubWrapI64 => "sub_wrap_i64",
            OpCode::MulWrapI64 => "mul_wrap_i64",
            OpCode::AddF32 => "add_f32",
            OpCode::SubF32 => "sub_f32",
            OpCode::MulF32 => "mul_f32",
            OpCode::DivF32 => "div_f32",
            OpCode::AddF64 => "add_f64",
            OpCode::SubF64 => "sub_f64",
            OpCode::MulF64 => "mul_f64",
            OpCode::DivF64 => "div_f64",
            OpCode::UnsafeDivI32 => "unsafe_div_i32",
            OpCode::UnsafeDivU32 => "unsafe_div_u32",
            OpCode::UnsafeDivI64 => "unsafe_div_i64",
            OpCode::UnsafeDivU64 => "unsafe_div_u64",
            OpCode::UnsafeModI32 => "unsafe_mod_i32",
            OpCode::UnsafeModU32 => "unsafe_mod_u32",
            OpCode::UnsafeModI64 => "unsafe_mod_i64",
            OpCode::UnsafeModU64 => "unsafe_mod_u64",
            OpCode::CmpI32 => "cmp_i32",
            OpCode::CmpU32 => "cmp_u32",
            OpCode::CmpI64 => "cmp_i64",
            OpCode::CmpU64 => "cmp_u64",
            OpCode::CmpU64I64 => "cmp_u64_i64",
            OpCode::CmpI64U64 => "cmp_i64_u64",
            OpCode::CmpF32 => "cmp_f32",
            OpCode::CmpF64 => "cmp_f64",
            OpCode::CmpEq => "cmp_eq",
            OpCode::CmpNeq => "cmp_neq",
            OpCode::CmpLt => "cmp_lt",
            OpCode::CmpLe => "cmp_le",
            OpCode::CmpGt => "cmp_gt",
            OpCode::CmpGe => "cmp_ge",
            OpCode::PointerMalloc => "pointer_malloc",
            OpCode::PointerRealloc => "pointer_realloc",
            OpCode::PointerSet => "pointer_set",
            OpCode::PointerGet => "pointer_get",
            OpCode::PointerNew => "pointer_new",
            OpCode::PointerAddress => "pointer_address",
            OpCode::PointerAdd => "pointer_add",
            OpCode::PointerDiff => "pointer_diff",
            OpCode::PointerIsNull => "pointer_is_null",
            OpCode::PointerIsNotNull => "pointer_is_not_null",
            OpCode::SetLocal => "set_local",
            OpCode::GetLocal => "get_local",
            OpCode::GetSelfIvar => "get_self_ivar",
            OpCode::SetSelfIvar => "set_self_ivar",
            OpCode::GetClassIvar => "get_class_ivar",
            OpCode::GetStructIvar => "get_struct_ivar",
            OpCode::ConstInitialized => "const_initialized",
            OpCode::GetConst => "get_const",
            OpCode::SetConst => "set_const",
            OpCode::ClassVarInitialized => "class_var_initialized",
            OpCode::GetClassVar => "get_class_var",
            OpCode::SetClassVar => "set_class_var",
            OpCode::Pop => "pop",
            OpCode::PopFromOffset => "pop_from_offset",
            OpCode::Dup => "dup",
            OpCode::PushZeros => "push_zeros",
            OpCode::PutStackTopPointer => "put_stack_top_pointer",
            OpCode::BranchIf => "branch_if",
            OpCode::BranchUnless => "branch_unless",
            OpCode::Jump => "jump",
            OpCode::Call => "call",
            OpCode::CallWithBlock => "call_with_block",
            OpCode::CallBlock => "call_block",
            OpCode::LibCall => "lib_call",
            OpCode::Leave => "leave",
            OpCode::LeaveDef => "leave_def",
            OpCode::BreakBlock => "break_block",
            OpCode::AllocateClass => "allocate_class",
            OpCode::PutInUnion => "put_in_union",
            OpCode::PutReferenceTypeInUnion => "put_reference_type_in_union",
            OpCode::PutNilableTypeInUnion => "put_nilable_type_in_union",
            OpCode::RemoveFromUnion => "remove_from_union",
            OpCode::UnionToBool => "union_to_bool",
            OpCode::ReferenceIsA => "reference_is_a",
            OpCode::UnionIsA => "union_is_a",
            OpCode::TupleIndexerKnownIndex => "tuple_indexer_known_index",
            OpCode::SymbolToS => "symbol_to_s",
            OpCode::ProcCall => "proc_call",
            OpCode::ProcToCFun => "proc_to_c_fun",
            OpCode::CFunToProc => "c_fun_to_proc",
            OpCode::LoadAtomic => "load_atomic",
            OpCode::StoreAtomic => "store_atomic",
            OpCode::AtomicRmw => "atomicrmw",
            OpCode::CmpXchg => "cmpxchg",
            OpCode::CurrentFiber => "current_fiber",
            OpCode::SpawnFiber => "spawn_fiber",
            OpCode::FiberSwapcontext => "fiber_swapcontext",
            OpCode::RaiseWithoutBacktrace => "raise_without_backtrace",
            OpCode::Reraise => "reraise",
            OpCode::CallStackUnwind => "call_stack_unwind",
            OpCode::ByteSwap => "byte_swap",
            OpCode::PopCount => "popcount",
            OpCode::LeadingZeros => "leading_zeros",
            OpCode::TrailingZeros => "trailing_zeros",
            OpCode::ReadCycleCounter => "read_cycle_counter",
            OpCode::CpuPause => "cpu_pause",
            OpCode::DebugTrap => "debug_trap",
            OpCode::MemCopy => "mem_copy",
            OpCode::MemMove => "mem_move",
            OpCode::MemSet => "mem_set",
            OpCode::CeilF32 => "ceil_f32",
            OpCode::CeilF64 => "ceil_f64",
            OpCode::CosF32 => "cos_f32",
            OpCode::CosF64 => "cos_f64",
            OpCode::ExpF32 => "exp_f32",
            OpCode::ExpF64 => "exp_f64",
            OpCode::FloorF32 => "floor_f32",
            OpCode::FloorF64 => "floor_f64",
            OpCode::LogF32 => "log_f32",
            OpCode::LogF64 => "log_f64",
            OpCode::RoundF32 => "round_f32",
            OpCode::RoundF64 => "round_f64",
            OpCode::RintF32 => "rint_f32",
            OpCode::RintF64 => "rint_f64",
            OpCode::SinF32 => "sin_f32",
            OpCode::SinF64 => "sin_f64",
            OpCode::SqrtF32 => "sqrt_f32",
            OpCode::SqrtF64 => "sqrt_f64",
            OpCode::TruncF32 => "trunc_f32",
            OpCode::TruncF64 => "trunc_f64",
            OpCode::PowF32 => "pow_f32",
            OpCode::PowF64 => "pow_f64",
            OpCode::PowiF32 => "powi_f32",
            OpCode::PowiF64 => "powi_f64",
            OpCode::MinF32 => "min_f32",
            OpCode::MinF64 => "min_f64",
            OpCode::MaxF32 => "max_f32",
            OpCode::MaxF64 => "max_f64",
            OpCode::CopysignF32 => "copysign_f32",
            OpCode::CopysignF64 => "copysign_f64",
            OpCode::PutArgc => "put_argc",
            OpCode::PutArgv => "put_argv",
            OpCode::Unreachable => "unreachable",
        }
    }
}

/// Read-modify-write operations selected by [`OpCode::AtomicRmw`]'s first
/// operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AtomicRmwOp {
    Add = 0,
    Sub,
    And,
    Nand,
    Or,
    Xor,
    Xchg,
    Max,
    Min,
    UMax,
    UMin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_repr() {
        assert_eq!(u8::from(OpCode::PutNil), 0);
        assert_eq!(u8::from(OpCode::PutI64), 1);
    }

    #[test]
    fn opcode_from_u8() {
        assert_eq!(OpCode::try_from(0u8).unwrap(), OpCode::PutNil);
        assert_eq!(OpCode::try_from(1u8).unwrap(), OpCode::PutI64);
        assert!(OpCode::try_from(0xffu8).is_err());
    }

    #[test]
    fn opcode_name() {
        assert_eq!(OpCode::PutI64.name(), "put_i64");
        assert_eq!(OpCode::AddWrapI32.name(), "add_wrap_i32");
        assert_eq!(OpCode::PutInUnion.name(), "put_in_union");
    }

    #[test]
    fn operand_sizes() {
        // Stack-only instructions
        assert_eq!(OpCode::AddI32.operand_size(), 0);
        assert_eq!(OpCode::ProcCall.operand_size(), 0);

        // 64-bit operands
        assert_eq!(OpCode::PutI64.operand_size(), 8);
        assert_eq!(OpCode::Call.operand_size(), 8);
        assert_eq!(OpCode::CallWithBlock.operand_size(), 16);

        // 32-bit operand groups
        assert_eq!(OpCode::Leave.operand_size(), 4);
        assert_eq!(OpCode::GetLocal.operand_size(), 8);
        assert_eq!(OpCode::PutInUnion.operand_size(), 12);

        // Atomics carry ordering selectors
        assert_eq!(OpCode::LoadAtomic.operand_size(), 5);
        assert_eq!(OpCode::AtomicRmw.operand_size(), 6);
        assert_eq!(OpCode::CmpXchg.operand_size(), 6);
    }

    #[test]
    fn rmw_op_from_u8() {
        assert_eq!(AtomicRmwOp::try_from(0u8).unwrap(), AtomicRmwOp::Add);
        assert_eq!(AtomicRmwOp::try_from(6u8).unwrap(), AtomicRmwOp::Xchg);
        assert!(AtomicRmwOp::try_from(0x40u8).is_err());
    }
}
