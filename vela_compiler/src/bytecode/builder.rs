//! Function builder for bytecode emission.
//!
//! The `FunctionBuilder` is a streaming emitter: higher-level translation
//! drives it one instruction at a time while it allocates typed registers,
//! tracks lexical scopes and virtual stacks, maintains the constant pools
//! and resolves forward jumps on finalization.
//!
//! Register indices are signed 8-bit and 1-based; 0 is reserved as "none".
//! Resource limits (256 entries per pool and table, 127 registers per
//! class, 24-bit jump targets) are compiler-driver invariants; exceeding
//! one is a bug in the driver and panics.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use vela_core::{Kind, RegisterClass, Type, Value};

use super::function::{Function, NativeFunction, Variable};
use super::instruction::{
    encode_addr, BitOperation, ChannelDir, Condition, Instruction, Label, MoveKind, Opcode,
    StackShift,
};

/// Streaming bytecode emitter for a single function.
///
/// A builder takes exclusive ownership of the function it is given and
/// overwrites any prior body. It is populated by a sequence of
/// instruction-emitting calls interleaved with scope and register
/// operations, then finalized exactly once with [`end`](Self::end), which
/// patches forward jumps and commits the register high-water marks.
pub struct FunctionBuilder {
    func: Function,
    /// Label address slots, 1-based ids; 0 means "not yet bound".
    labels: Vec<u32>,
    /// Pending forward jumps: instruction address to label id.
    gotos: FxHashMap<u32, u32>,
    /// Per-class high-water marks.
    max_regs: [u8; 4],
    /// Per-class current register counts.
    num_regs: [u8; 4],
    /// Lexical scope frames mapping names to registers.
    scopes: SmallVec<[FxHashMap<String, i8>; 4]>,
    /// Virtual stack frames: per-class counts at entry.
    scope_shifts: SmallVec<[StackShift; 4]>,
}

impl FunctionBuilder {
    /// Create a builder for `func`, discarding any body it already has.
    #[must_use]
    pub fn new(mut func: Function) -> Self {
        func.body.clear();
        Self {
            func,
            labels: Vec::new(),
            gotos: FxHashMap::default(),
            max_regs: [0; 4],
            num_regs: [0; 4],
            scopes: SmallVec::new(),
            scope_shifts: SmallVec::new(),
        }
    }

    /// The function under construction. Forward jumps are unpatched and
    /// register counts uncommitted until [`end`](Self::end).
    #[inline]
    #[must_use]
    pub fn function(&self) -> &Function {
        &self.func
    }

    // =========================================================================
    // Scopes and virtual stacks
    // =========================================================================

    /// Enter a new scope. Every `enter_scope` call must be paired with a
    /// corresponding `exit_scope` call.
    pub fn enter_scope(&mut self) {
        self.scopes.push(FxHashMap::default());
        self.enter_stack();
    }

    /// Exit the innermost scope.
    pub fn exit_scope(&mut self) {
        self.scopes.pop();
        self.exit_stack();
    }

    /// Enter a new virtual stack. Registers allocated inside it are
    /// returned to the free pool by the matching `exit_stack` call.
    pub fn enter_stack(&mut self) {
        let shift = StackShift([
            self.num_regs[0] as i8,
            self.num_regs[1] as i8,
            self.num_regs[2] as i8,
            self.num_regs[3] as i8,
        ]);
        self.scope_shifts.push(shift);
    }

    /// Exit the current virtual stack, restoring the per-class register
    /// counts recorded at entry.
    pub fn exit_stack(&mut self) {
        let shift = self
            .scope_shifts
            .pop()
            .expect("exit_stack without matching enter_stack");
        for i in 0..4 {
            self.num_regs[i] = shift.0[i] as u8;
        }
    }

    // =========================================================================
    // Registers
    // =========================================================================

    /// Allocate a new register of the class `kind` lowers to.
    pub fn new_register(&mut self, kind: Kind) -> i8 {
        let class = kind.class();
        let num = self.num_regs[class.index()];
        if num == i8::MAX as u8 {
            panic!("{class:?} registers limit reached");
        }
        let reg = (num + 1) as i8;
        self.alloc_register(class, reg);
        reg
    }

    /// Record that `reg` of `class` is touched by emitted code, raising the
    /// class counters if necessary. Idempotent; non-positive values (the
    /// "none" register and constant indices) are ignored.
    fn alloc_register(&mut self, class: RegisterClass, reg: i8) {
        if reg > 0 {
            let i = class.index();
            let reg = reg as u8;
            if reg > self.max_regs[i] {
                self.max_regs[i] = reg;
            }
            if reg > self.num_regs[i] {
                self.num_regs[i] = reg;
            }
        }
    }

    /// Bind `name` to register `reg` in the innermost scope.
    pub fn bind_var_reg(&mut self, name: impl Into<String>, reg: i8) {
        self.scopes
            .last_mut()
            .expect("bind_var_reg without an open scope")
            .insert(name.into(), reg);
    }

    /// Whether `name` is bound in any open scope.
    #[must_use]
    pub fn is_variable(&self, name: &str) -> bool {
        self.scopes.iter().rev().any(|s| s.contains_key(name))
    }

    /// The register bound to `name`. Panics if the name is not bound; the
    /// driver must check with [`is_variable`](Self::is_variable) first.
    #[must_use]
    pub fn scope_lookup(&self, name: &str) -> i8 {
        for scope in self.scopes.iter().rev() {
            if let Some(&reg) = scope.get(name) {
                return reg;
            }
        }
        panic!("bug: {name} not found");
    }

    // =========================================================================
    // Constant pools and tables
    // =========================================================================

    /// Append an integer constant, returning its index. Constants are not
    /// deduplicated.
    pub fn make_int_constant(&mut self, c: i64) -> i8 {
        let r = self.func.constants.int.len();
        if r > 255 {
            panic!("int constants limit reached");
        }
        self.func.constants.int.push(c);
        r as i8
    }

    /// Append a float constant, returning its index.
    pub fn make_float_constant(&mut self, c: f64) -> i8 {
        let r = self.func.constants.float.len();
        if r > 255 {
            panic!("float constants limit reached");
        }
        self.func.constants.float.push(c);
        r as i8
    }

    /// Append a string constant, returning its index.
    pub fn make_string_constant(&mut self, c: impl Into<String>) -> i8 {
        let r = self.func.constants.string.len();
        if r > 255 {
            panic!("string constants limit reached");
        }
        self.func.constants.string.push(c.into());
        r as i8
    }

    /// Append a general constant, returning its index.
    pub fn make_general_constant(&mut self, v: Value) -> i8 {
        let r = self.func.constants.general.len();
        if r > 255 {
            panic!("general constants limit reached");
        }
        self.func.constants.general.push(v);
        r as i8
    }

    /// Append an interface-typed constant to the general pool, returning
    /// its index in the negative subspace: the n-th call yields `-n`.
    pub fn make_interface_constant(&mut self, v: Value) -> i8 {
        let r = -(self.func.constants.general.len() as i32) - 1;
        if r == -129 {
            panic!("interface constants limit reached");
        }
        self.func.constants.general.push(v);
        r as i8
    }

    /// The index of `typ` in the type table, inserting it if new. Unlike
    /// the constant pools, the type table deduplicates.
    pub fn add_type(&mut self, typ: Type) -> i8 {
        if let Some(i) = self.func.types.iter().position(|t| *t == typ) {
            return i as i8;
        }
        if self.func.types.len() == 256 {
            panic!("types limit reached");
        }
        let i = self.func.types.len();
        self.func.types.push(typ);
        i as i8
    }

    /// Add a package-level variable reference, returning its index.
    pub fn add_variable(&mut self, v: Variable) -> u8 {
        let r = self.func.variables.len();
        if r > 255 {
            panic!("variables limit reached");
        }
        self.func.variables.push(v);
        r as u8
    }

    /// Add a native function reference, returning its index.
    pub fn add_native_function(&mut self, f: Arc<NativeFunction>) -> u8 {
        let r = self.func.native_functions.len();
        if r > 255 {
            panic!("native functions limit reached");
        }
        self.func.native_functions.push(f);
        r as u8
    }

    /// Add a nested compiled function, returning its index. Nested
    /// functions are built first by their own builder, then registered
    /// here; [`emit_func`](Self::emit_func) loads them by index.
    pub fn add_function(&mut self, f: Arc<Function>) -> u8 {
        let r = self.func.functions.len();
        if r > 255 {
            panic!("functions limit reached");
        }
        self.func.functions.push(f);
        r as u8
    }

    // =========================================================================
    // Labels and addresses
    // =========================================================================

    /// The address the next emitted instruction will have.
    #[inline]
    #[must_use]
    pub fn current_addr(&self) -> u32 {
        self.func.body.len() as u32
    }

    /// Create a new, unbound label. Bind it with
    /// [`set_label_addr`](Self::set_label_addr).
    pub fn new_label(&mut self) -> Label {
        self.labels.push(0);
        Label(self.labels.len() as u32)
    }

    /// Bind `label` to the current address.
    pub fn set_label_addr(&mut self, label: Label) {
        let addr = self.current_addr();
        self.labels[(label.0 - 1) as usize] = addr;
    }

    // =========================================================================
    // Debug information
    // =========================================================================

    /// Record that the instruction at `pc` originates from source `line`.
    /// Only instructions that can fault need an entry.
    pub fn add_line(&mut self, pc: u32, line: u32) {
        self.func.lines.insert(pc, line);
    }

    /// Stamp the function's declaration site.
    pub fn set_file_line(&mut self, file: impl Into<String>, line: u32) {
        self.func.file = file.into();
        self.func.line = line;
    }

    /// Install the closure-capture reference list.
    pub fn set_closure_refs(&mut self, refs: Vec<i16>) {
        self.func.closure_refs = refs;
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Finalize the function: patch pending forward jumps and commit the
    /// register high-water marks. Consumes the builder, so further
    /// emission is impossible.
    #[must_use]
    pub fn end(mut self) -> Function {
        if self.func.body.len() > 0xFF_FFFF {
            panic!("function body exceeds the 24-bit address space");
        }
        for (&addr, &label) in &self.gotos {
            let target = self.labels[(label - 1) as usize];
            let inst = &mut self.func.body[addr as usize];
            let (a, b, c) = encode_addr(target);
            inst.a = a;
            inst.b = b;
            inst.c = c;
        }
        self.gotos.clear();
        for i in 0..4 {
            if self.max_regs[i] > self.func.reg_num[i] {
                self.func.reg_num[i] = self.max_regs[i];
            }
        }
        self.func
    }

    // =========================================================================
    // Instruction emission
    // =========================================================================

    #[inline]
    fn emit(&mut self, inst: Instruction) {
        self.func.body.push(inst);
    }

    #[inline]
    fn emit_op(&mut self, op: Opcode, k: bool, a: i8, b: i8, c: i8) {
        let mut op = op.value();
        if k {
            op = -op;
        }
        self.emit(Instruction::raw(op, a, b, c));
    }

    /// Append a no-op.
    pub fn emit_nop(&mut self) {
        self.emit(Instruction::new(Opcode::None, 0, 0, 0));
    }

    // --- Arithmetic ---

    /// `z = x + y`. With `k`, `y` is an int or float constant-pool index.
    pub fn emit_add(&mut self, k: bool, x: i8, y: i8, z: i8, kind: Kind) {
        let class = kind.class();
        self.alloc_register(class, x);
        if !k {
            self.alloc_register(class, y);
        }
        self.alloc_register(class, z);
        let op = match kind {
            Kind::Int | Kind::Int64 | Kind::Uint | Kind::Uint64 => Opcode::AddInt,
            Kind::Int32 | Kind::Uint32 => Opcode::AddInt32,
            Kind::Int16 | Kind::Uint16 => Opcode::AddInt16,
            Kind::Int8 | Kind::Uint8 => Opcode::AddInt8,
            Kind::Float64 => Opcode::AddFloat64,
            Kind::Float32 => Opcode::AddFloat32,
            _ => panic!("add: invalid type"),
        };
        self.emit_op(op, k, x, y, z);
    }

    /// `z = x - y`.
    pub fn emit_sub(&mut self, k: bool, x: i8, y: i8, z: i8, kind: Kind) {
        let class = kind.class();
        self.alloc_register(class, x);
        if !k {
            self.alloc_register(class, y);
        }
        self.alloc_register(class, z);
        let op = match kind {
            Kind::Int | Kind::Int64 | Kind::Uint | Kind::Uint64 => Opcode::SubInt,
            Kind::Int32 | Kind::Uint32 => Opcode::SubInt32,
            Kind::Int16 | Kind::Uint16 => Opcode::SubInt16,
            Kind::Int8 | Kind::Uint8 => Opcode::SubInt8,
            Kind::Float64 => Opcode::SubFloat64,
            Kind::Float32 => Opcode::SubFloat32,
            _ => panic!("sub: invalid type"),
        };
        self.emit_op(op, k, x, y, z);
    }

    /// `z = y - x`; the inverse pairing lets a constant first operand be
    /// folded by swapping.
    pub fn emit_sub_inv(&mut self, k: bool, x: i8, y: i8, z: i8, kind: Kind) {
        let class = kind.class();
        self.alloc_register(class, x);
        if !k {
            self.alloc_register(class, y);
        }
        self.alloc_register(class, z);
        let op = match kind {
            Kind::Int | Kind::Int64 | Kind::Uint | Kind::Uint64 => Opcode::SubInvInt,
            Kind::Int32 | Kind::Uint32 => Opcode::SubInvInt32,
            Kind::Int16 | Kind::Uint16 => Opcode::SubInvInt16,
            Kind::Int8 | Kind::Uint8 => Opcode::SubInvInt8,
            Kind::Float64 => Opcode::SubInvFloat64,
            Kind::Float32 => Opcode::SubInvFloat32,
            _ => panic!("subInv: invalid type"),
        };
        self.emit_op(op, k, x, y, z);
    }

    /// `z = x * y`.
    pub fn emit_mul(&mut self, k: bool, x: i8, y: i8, z: i8, kind: Kind) {
        let class = kind.class();
        self.alloc_register(class, x);
        if !k {
            self.alloc_register(class, y);
        }
        self.alloc_register(class, z);
        let op = match kind {
            Kind::Int | Kind::Int64 | Kind::Uint | Kind::Uint64 => Opcode::MulInt,
            Kind::Int32 | Kind::Uint32 => Opcode::MulInt32,
            Kind::Int16 | Kind::Uint16 => Opcode::MulInt16,
            Kind::Int8 | Kind::Uint8 => Opcode::MulInt8,
            Kind::Float64 => Opcode::MulFloat64,
            Kind::Float32 => Opcode::MulFloat32,
            _ => panic!("mul: invalid type"),
        };
        self.emit_op(op, k, x, y, z);
    }

    /// `z = x / y`. Signedness selects the opcode; division by a constant
    /// zero is left to the interpreter to fault on.
    pub fn emit_div(&mut self, k: bool, x: i8, y: i8, z: i8, kind: Kind) {
        let class = kind.class();
        self.alloc_register(class, x);
        if !k {
            self.alloc_register(class, y);
        }
        self.alloc_register(class, z);
        let op = match kind {
            Kind::Int | Kind::Int64 => Opcode::DivInt,
            Kind::Int32 => Opcode::DivInt32,
            Kind::Int16 => Opcode::DivInt16,
            Kind::Int8 => Opcode::DivInt8,
            Kind::Uint | Kind::Uint64 => Opcode::DivUint64,
            Kind::Uint32 => Opcode::DivUint32,
            Kind::Uint16 => Opcode::DivUint16,
            Kind::Uint8 => Opcode::DivUint8,
            Kind::Float64 => Opcode::DivFloat64,
            Kind::Float32 => Opcode::DivFloat32,
            _ => panic!("div: invalid type"),
        };
        self.emit_op(op, k, x, y, z);
    }

    /// `z = x % y`.
    pub fn emit_rem(&mut self, k: bool, x: i8, y: i8, z: i8, kind: Kind) {
        let class = kind.class();
        self.alloc_register(class, x);
        if !k {
            self.alloc_register(class, y);
        }
        self.alloc_register(class, z);
        let op = match kind {
            Kind::Int | Kind::Int64 => Opcode::RemInt,
            Kind::Int32 => Opcode::RemInt32,
            Kind::Int16 => Opcode::RemInt16,
            Kind::Int8 => Opcode::RemInt8,
            Kind::Uint | Kind::Uint64 => Opcode::RemUint64,
            Kind::Uint32 => Opcode::RemUint32,
            Kind::Uint16 => Opcode::RemUint16,
            Kind::Uint8 => Opcode::RemUint8,
            _ => panic!("rem: invalid type"),
        };
        self.emit_op(op, k, x, y, z);
    }

    /// `dst = x op y` for the bitwise operation family. Shift opcodes
    /// narrow by operand width; right shifts of unsigned kinds use the
    /// logical variant.
    pub fn emit_binary_bit(
        &mut self,
        operator: BitOperation,
        ky: bool,
        x: i8,
        y: i8,
        dst: i8,
        kind: Kind,
    ) {
        self.alloc_register(RegisterClass::Int, x);
        if !ky {
            self.alloc_register(RegisterClass::Int, y);
        }
        self.alloc_register(RegisterClass::Int, dst);
        let op = match operator {
            BitOperation::And => Opcode::And,
            BitOperation::Or => Opcode::Or,
            BitOperation::Xor => Opcode::Xor,
            BitOperation::AndNot => Opcode::AndNot,
            BitOperation::LeftShift => match kind {
                Kind::Int8 | Kind::Uint8 => Opcode::LeftShift8,
                Kind::Int16 | Kind::Uint16 => Opcode::LeftShift16,
                Kind::Int32 | Kind::Uint32 => Opcode::LeftShift32,
                _ => Opcode::LeftShift,
            },
            BitOperation::RightShift => {
                if kind.is_unsigned() {
                    Opcode::RightShiftU
                } else {
                    Opcode::RightShift
                }
            }
        };
        self.emit_op(op, ky, x, y, dst);
    }

    // --- Data movement ---

    /// `z = x`. The move kind in operand `a` tells the interpreter which
    /// register files are involved.
    pub fn emit_move(&mut self, k: bool, x: i8, z: i8, src_kind: Kind, dst_kind: Kind) {
        if !k {
            self.alloc_register(src_kind.class(), x);
        }
        self.alloc_register(dst_kind.class(), z);
        let move_kind = match dst_kind.class() {
            RegisterClass::Int => MoveKind::IntInt,
            RegisterClass::Float => MoveKind::FloatFloat,
            RegisterClass::String => MoveKind::StringString,
            RegisterClass::General => match src_kind.class() {
                RegisterClass::Int => MoveKind::IntGeneral,
                RegisterClass::Float => MoveKind::FloatGeneral,
                RegisterClass::String => MoveKind::StringGeneral,
                RegisterClass::General => MoveKind::GeneralGeneral,
            },
        };
        self.emit_op(Opcode::Move, k, move_kind as i8, x, z);
    }

    /// `dst = constants[index]` for the numeric pools; `class` selects the
    /// int or float pool in operand `a`.
    pub fn emit_load_number(&mut self, class: RegisterClass, index: i8, dst: i8) {
        let a = match class {
            RegisterClass::Int => 0,
            RegisterClass::Float => 1,
            _ => panic!("load_number only accepts Int or Float registers"),
        };
        self.alloc_register(class, dst);
        self.emit(Instruction::new(Opcode::LoadNumber, a, index, dst));
    }

    /// `z = concat(s, t)`.
    pub fn emit_concat(&mut self, s: i8, t: i8, z: i8) {
        self.alloc_register(RegisterClass::String, s);
        self.alloc_register(RegisterClass::String, t);
        self.alloc_register(RegisterClass::String, z);
        self.emit(Instruction::new(Opcode::Concat, s, t, z));
    }

    // --- Jumps ---

    /// `goto label`. If the label is already bound, its 24-bit address is
    /// encoded into the operands; otherwise a fixup is recorded and patched
    /// on [`end`](Self::end).
    pub fn emit_goto(&mut self, label: Label) {
        let mut inst = Instruction::new(Opcode::Goto, 0, 0, 0);
        let addr = self.labels[(label.0 - 1) as usize];
        if addr == 0 {
            self.gotos.insert(self.current_addr(), label.0);
        } else {
            let (a, b, c) = encode_addr(addr);
            inst.a = a;
            inst.b = b;
            inst.c = c;
        }
        self.emit(inst);
    }

    /// Conditional skip: evaluates `x cond y` for the class `kind` lowers
    /// to. With `k`, `y` is a constant-pool index. Interface-class
    /// operands have no `If` opcode and are rejected.
    pub fn emit_if(&mut self, k: bool, x: i8, cond: Condition, y: i8, kind: Kind) {
        let class = kind.class();
        self.alloc_register(class, x);
        if !k {
            self.alloc_register(class, y);
        }
        let op = match class {
            RegisterClass::Int => Opcode::IfInt,
            RegisterClass::Float => Opcode::IfFloat,
            RegisterClass::String => Opcode::IfString,
            RegisterClass::General => panic!("if: invalid type"),
        };
        self.emit_op(op, k, x, cond as i8, y);
    }

    // --- Calls ---

    /// `f()` where `f` indexes the nested-function table. Two words: the
    /// primary instruction and the stack shift.
    pub fn emit_call(&mut self, f: i8, shift: StackShift, line: u32) {
        self.emit(Instruction::new(Opcode::Call, f, 0, 0));
        self.emit(Instruction::raw(shift.0[0], shift.0[1], shift.0[2], shift.0[3]));
        let pc = self.current_addr() - 2;
        self.add_line(pc, line);
    }

    /// `p.F()` where `f` indexes the native-function table.
    pub fn emit_call_native(&mut self, f: i8, num_variadic: i8, shift: StackShift) {
        self.emit(Instruction::new(Opcode::CallNative, f, 0, num_variadic));
        self.emit(Instruction::raw(shift.0[0], shift.0[1], shift.0[2], shift.0[3]));
    }

    /// `f()` where `f` is a general register holding a function value.
    pub fn emit_call_indirect(&mut self, f: i8, num_variadic: i8, shift: StackShift) {
        self.alloc_register(RegisterClass::General, f);
        self.emit(Instruction::new(Opcode::CallIndirect, f, 0, num_variadic));
        self.emit(Instruction::raw(shift.0[0], shift.0[1], shift.0[2], shift.0[3]));
    }

    /// Tail call.
    pub fn emit_tail_call(&mut self, f: i8, line: u32) {
        self.emit(Instruction::new(Opcode::TailCall, f, 0, 0));
        let pc = self.current_addr() - 1;
        self.add_line(pc, line);
    }

    /// `defer f(...)`. Three words: the primary instruction, the register
    /// window offset and the argument shift.
    pub fn emit_defer(&mut self, f: i8, num_variadic: i8, off: StackShift, arg: StackShift) {
        self.alloc_register(RegisterClass::General, f);
        self.emit(Instruction::new(Opcode::Defer, f, 0, num_variadic));
        self.emit(Instruction::raw(off.0[0], off.0[1], off.0[2], off.0[3]));
        self.emit(Instruction::raw(arg.0[0], arg.0[1], arg.0[2], arg.0[3]));
    }

    /// `go`: runs the call built by the following call instruction in a
    /// new goroutine.
    pub fn emit_go(&mut self) {
        self.emit(Instruction::new(Opcode::Go, 0, 0, 0));
    }

    /// `return`.
    pub fn emit_return(&mut self) {
        self.emit(Instruction::new(Opcode::Return, 0, 0, 0));
    }

    // --- Functions and closures ---

    /// `r = func() { ... }`: load the nested function with index `index`
    /// (registered with [`add_function`](Self::add_function)) into a
    /// general register.
    pub fn emit_func(&mut self, index: u8, r: i8) {
        self.alloc_register(RegisterClass::General, r);
        self.emit(Instruction::new(Opcode::Func, 0, index as i8, r));
    }

    /// `z = p.f`: load a function value from the script or native table.
    pub fn emit_get_func(&mut self, native: bool, f: i8, z: i8) {
        self.alloc_register(RegisterClass::General, z);
        self.emit(Instruction::new(Opcode::GetFunc, i8::from(native), f, z));
    }

    /// `r = cv`: load the closure variable with index `cv`.
    pub fn emit_bind(&mut self, cv: u8, r: i8) {
        self.alloc_register(RegisterClass::General, r);
        self.emit(Instruction::new(Opcode::Bind, 0, cv as i8, r));
    }

    // --- Package variables ---

    /// `z = p.v`.
    pub fn emit_get_var(&mut self, v: u8, z: i8) {
        self.alloc_register(RegisterClass::General, z);
        self.emit(Instruction::new(Opcode::GetVar, v as i8, 0, z));
    }

    /// `p.v = r`.
    pub fn emit_set_var(&mut self, r: i8, v: u8) {
        self.emit(Instruction::new(Opcode::SetVar, 0, r, v as i8));
    }

    // --- Composites ---

    /// `dst = make(typ, capacity)` for channels.
    pub fn emit_make_chan(&mut self, typ: i8, k_capacity: bool, capacity: i8, dst: i8) {
        self.alloc_register(RegisterClass::General, dst);
        self.emit_op(Opcode::MakeChan, k_capacity, typ, capacity, dst);
    }

    /// `dst = make(typ, size)` for maps.
    pub fn emit_make_map(&mut self, typ: i8, k_size: bool, size: i8, dst: i8) {
        self.alloc_register(RegisterClass::General, dst);
        self.emit_op(Opcode::MakeMap, k_size, typ, size, dst);
    }

    /// `dst = make(slice_type, len, cap)`. When a length or capacity is
    /// present, a second word carries them; its `k` bits in operand `b`
    /// flag which of the two are constants.
    pub fn emit_make_slice(
        &mut self,
        k_len: bool,
        k_cap: bool,
        slice_type: Type,
        len: i8,
        cap: i8,
        dst: i8,
    ) {
        self.alloc_register(RegisterClass::General, dst);
        let t = self.add_type(slice_type);
        let k = if len == 0 && cap == 0 {
            1
        } else {
            (i8::from(k_len) << 1) | (i8::from(k_cap) << 2)
        };
        self.emit(Instruction::new(Opcode::MakeSlice, t, k, dst));
        if k > 1 {
            self.emit(Instruction::raw(0, len, cap, 0));
        }
    }

    /// `z = new(t)`.
    pub fn emit_new(&mut self, typ: Type, z: i8) {
        self.alloc_register(RegisterClass::General, z);
        let t = self.add_type(typ);
        self.emit(Instruction::new(Opcode::New, t, 0, z));
    }

    /// `s = append(s, regs[first .. first+length])`.
    pub fn emit_append(&mut self, first: i8, length: i8, s: i8) {
        self.alloc_register(RegisterClass::General, s);
        self.emit(Instruction::new(Opcode::Append, first, length, s));
    }

    /// `s = append(s, t...)`.
    pub fn emit_append_slice(&mut self, t: i8, s: i8) {
        self.alloc_register(RegisterClass::General, t);
        self.alloc_register(RegisterClass::General, s);
        self.emit(Instruction::new(Opcode::AppendSlice, t, 0, s));
    }

    /// `copy(dst, src)`, or `n = copy(dst, src)` when `n` is not 0.
    pub fn emit_copy(&mut self, dst: i8, src: i8, n: i8) {
        self.alloc_register(RegisterClass::General, dst);
        self.alloc_register(RegisterClass::General, src);
        self.emit(Instruction::new(Opcode::Copy, src, n, dst));
    }

    /// `delete(m, k)`.
    pub fn emit_delete(&mut self, m: i8, k: i8) {
        self.alloc_register(RegisterClass::General, m);
        self.alloc_register(RegisterClass::General, k);
        self.emit(Instruction::new(Opcode::Delete, m, k, 0));
    }

    /// `dst = expr[i]`; the opcode narrows by the indexed type.
    pub fn emit_index(&mut self, ki: bool, expr: i8, i: i8, dst: i8, expr_type: &Type) {
        let op = match expr_type.kind() {
            Kind::Slice => Opcode::SliceIndex,
            Kind::String => Opcode::StringIndex,
            Kind::Map => Opcode::MapIndex,
            _ => Opcode::Index,
        };
        self.emit_op(op, ki, expr, i, dst);
    }

    /// `m[key] = value`.
    ///
    /// Operand order is `{a: map, b: value, c: key}`: the value comes
    /// before the key, inverting the mnemonic order. The interpreter
    /// decodes it this way; keep them in sync.
    pub fn emit_set_map(&mut self, k: bool, m: i8, value: i8, key: i8) {
        self.emit_op(Opcode::SetMap, k, m, value, key);
    }

    /// `slice[index] = value`.
    pub fn emit_set_slice(&mut self, k: bool, slice: i8, value: i8, index: i8) {
        self.emit_op(Opcode::SetSlice, k, slice, value, index);
    }

    /// `c = a.field`.
    pub fn emit_selector(&mut self, a: i8, field: i8, c: i8) {
        self.emit(Instruction::new(Opcode::Selector, a, field, c));
    }

    /// `l = len(s)`. Operand `a` selects a specialized length path for a
    /// handful of common types; 1 is the generic fallback.
    pub fn emit_len(&mut self, s: i8, l: i8, typ: &Type) {
        self.alloc_register(RegisterClass::General, s);
        self.alloc_register(RegisterClass::Int, l);
        let a = match typ {
            Type::Str => 0,
            Type::Slice(elem) => match **elem {
                Type::Uint8 => 2,
                Type::Str => 4,
                Type::Interface => 5,
                _ => 1,
            },
            Type::Map(k, v) if **k == Type::Str => match **v {
                Type::Str => 6,
                Type::Int => 7,
                Type::Interface => 8,
                _ => 1,
            },
            _ => 1,
        };
        self.emit(Instruction::new(Opcode::Len, a, s, l));
    }

    /// `z = cap(s)`.
    pub fn emit_cap(&mut self, s: i8, z: i8) {
        self.alloc_register(RegisterClass::General, s);
        self.alloc_register(RegisterClass::Int, z);
        self.emit(Instruction::new(Opcode::Cap, s, 0, z));
    }

    /// Begin iteration over `expr`; strings have a dedicated opcode.
    pub fn emit_range(&mut self, expr: i8, kind: Kind) {
        let op = match kind {
            Kind::String => Opcode::RangeString,
            _ => Opcode::Range,
        };
        self.emit(Instruction::new(op, 0, 0, expr));
    }

    // --- Interfaces and conversions ---

    /// `z = e.(t)`; scalar targets use specialized opcodes, everything
    /// else goes through the type table.
    pub fn emit_assert(&mut self, e: i8, typ: Type, z: i8) {
        self.alloc_register(RegisterClass::General, e);
        let (op, tr) = match typ {
            Type::Int => {
                self.alloc_register(RegisterClass::Int, z);
                (Opcode::AssertInt, 0)
            }
            Type::Float64 => {
                self.alloc_register(RegisterClass::Float, z);
                (Opcode::AssertFloat64, 0)
            }
            Type::Str => {
                self.alloc_register(RegisterClass::String, z);
                (Opcode::AssertString, 0)
            }
            typ => {
                self.alloc_register(RegisterClass::General, z);
                (Opcode::Assert, self.add_type(typ))
            }
        };
        self.emit(Instruction::new(op, e, tr, z));
    }

    /// `dst = typ(src)`; the opcode is selected by the source kind.
    pub fn emit_convert(&mut self, src: i8, typ: Type, dst: i8, src_kind: Kind) {
        let reg_type = self.add_type(typ);
        self.alloc_register(RegisterClass::General, dst);
        let op = match src_kind.class() {
            RegisterClass::General => Opcode::Convert,
            RegisterClass::Int => {
                if src_kind.is_unsigned() {
                    Opcode::ConvertUint
                } else {
                    Opcode::ConvertInt
                }
            }
            RegisterClass::String => Opcode::ConvertString,
            RegisterClass::Float => Opcode::ConvertFloat,
        };
        self.emit(Instruction::new(op, src, reg_type, dst));
    }

    // --- Channels and select ---

    /// `ch <- v`.
    pub fn emit_send(&mut self, ch: i8, v: i8) {
        self.emit(Instruction::new(Opcode::Send, v, 0, ch));
    }

    /// `dst = <-ch`, or `dst, ok = <-ch` when `ok` is not 0.
    pub fn emit_receive(&mut self, ch: i8, ok: i8, dst: i8) {
        self.emit(Instruction::new(Opcode::Receive, ch, ok, dst));
    }

    /// A select case: `case ch <- value`, `case value = <-ch` or
    /// `default`.
    pub fn emit_case(&mut self, kvalue: bool, dir: ChannelDir, value: i8, ch: i8, kind: Kind) {
        if !kvalue && value != 0 {
            self.alloc_register(kind.class(), value);
        }
        if ch != 0 {
            self.alloc_register(RegisterClass::General, ch);
        }
        self.emit_op(Opcode::Case, kvalue, dir as i8, value, ch);
    }

    /// `select`.
    pub fn emit_select(&mut self) {
        self.emit(Instruction::new(Opcode::Select, 0, 0, 0));
    }

    // --- Diagnostics ---

    /// `panic(v)`.
    pub fn emit_panic(&mut self, v: i8, line: u32) {
        self.alloc_register(RegisterClass::General, v);
        self.emit(Instruction::new(Opcode::Panic, v, 0, 0));
        let pc = self.current_addr() - 1;
        self.add_line(pc, line);
    }

    /// `print(arg)`.
    pub fn emit_print(&mut self, arg: i8) {
        self.emit(Instruction::new(Opcode::Print, arg, 0, 0));
    }

    /// `r = recover()`.
    pub fn emit_recover(&mut self, r: i8) {
        self.alloc_register(RegisterClass::General, r);
        self.emit(Instruction::new(Opcode::Recover, 0, 0, r));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_core::Type;

    fn new_builder() -> FunctionBuilder {
        FunctionBuilder::new(Function::new(
            "main",
            "test",
            Type::Func {
                params: vec![],
                results: vec![],
            },
        ))
    }

    #[test]
    fn test_new_builder_clears_body() {
        let mut func = Function::new(
            "main",
            "stale",
            Type::Func {
                params: vec![],
                results: vec![],
            },
        );
        func.body.push(Instruction::new(Opcode::Return, 0, 0, 0));
        let builder = FunctionBuilder::new(func);
        assert!(builder.function().body.is_empty());
    }

    #[test]
    fn test_scope_based_register_reuse() {
        let mut b = new_builder();
        b.enter_stack();
        let r1 = b.new_register(Kind::Int);
        let r2 = b.new_register(Kind::Int);
        b.exit_stack();
        let r3 = b.new_register(Kind::Int);
        assert_eq!(r1, 1);
        assert_eq!(r2, 2);
        assert_eq!(r3, 1);
        let func = b.end();
        assert_eq!(func.reg_num[RegisterClass::Int.index()], 2);
    }

    #[test]
    fn test_scope_restores_counts_of_every_class() {
        let mut b = new_builder();
        let before = [
            b.new_register(Kind::Int),
            b.new_register(Kind::Float64),
            b.new_register(Kind::String),
            b.new_register(Kind::Interface),
        ];
        b.enter_scope();
        b.new_register(Kind::Int);
        b.new_register(Kind::Float64);
        b.new_register(Kind::String);
        b.new_register(Kind::Interface);
        b.exit_scope();
        let after = [
            b.new_register(Kind::Int),
            b.new_register(Kind::Float64),
            b.new_register(Kind::String),
            b.new_register(Kind::Interface),
        ];
        for (x, y) in before.iter().zip(after.iter()) {
            assert_eq!(*y, *x + 1);
        }
    }

    #[test]
    fn test_forward_jump_is_patched_on_end() {
        let mut b = new_builder();
        let lbl = b.new_label();
        b.emit_goto(lbl);
        let a = b.current_addr();
        b.emit_nop();
        b.set_label_addr(lbl);
        let func = b.end();
        let inst = func.body[0];
        assert_eq!(inst.op, Opcode::Goto as i8);
        assert_eq!(decode_addr_of(inst), a + 1);
    }

    #[test]
    fn test_backward_jump_is_encoded_immediately() {
        let mut b = new_builder();
        b.emit_nop();
        let lbl = b.new_label();
        b.set_label_addr(lbl);
        b.emit_nop();
        b.emit_goto(lbl);
        assert_eq!(decode_addr_of(b.function().body[2]), 1);
    }

    #[test]
    fn test_constant_operand_negates_opcode() {
        let mut b = new_builder();
        b.emit_add(true, 1, 5, 2, Kind::Int);
        let inst = b.function().body[0];
        assert_eq!(inst.op, -(Opcode::AddInt as i8));
        assert_eq!((inst.a, inst.b, inst.c), (1, 5, 2));
    }

    #[test]
    fn test_add_without_constant_keeps_opcode_positive() {
        let mut b = new_builder();
        b.emit_add(false, 1, 2, 3, Kind::Int);
        let inst = b.function().body[0];
        assert_eq!(inst.op, Opcode::AddInt as i8);
    }

    #[test]
    fn test_add_selects_opcode_by_width() {
        let mut b = new_builder();
        b.emit_add(false, 1, 2, 3, Kind::Int8);
        b.emit_add(false, 1, 2, 3, Kind::Uint16);
        b.emit_add(false, 1, 2, 3, Kind::Int32);
        b.emit_add(false, 1, 2, 3, Kind::Float32);
        b.emit_add(false, 1, 2, 3, Kind::Float64);
        let ops: Vec<i8> = b.function().body.iter().map(|i| i.op).collect();
        assert_eq!(
            ops,
            vec![
                Opcode::AddInt8 as i8,
                Opcode::AddInt16 as i8,
                Opcode::AddInt32 as i8,
                Opcode::AddFloat32 as i8,
                Opcode::AddFloat64 as i8,
            ]
        );
    }

    #[test]
    fn test_registers_raise_high_water_marks() {
        let mut b = new_builder();
        b.emit_add(false, 3, 7, 2, Kind::Int);
        let func = b.end();
        assert_eq!(func.reg_num[RegisterClass::Int.index()], 7);
    }

    #[test]
    fn test_constant_operand_does_not_raise_marks() {
        let mut b = new_builder();
        // y = 100 is a constant index, not a register.
        b.emit_add(true, 1, 100, 2, Kind::Int);
        let func = b.end();
        assert_eq!(func.reg_num[RegisterClass::Int.index()], 2);
    }

    #[test]
    #[should_panic(expected = "registers limit reached")]
    fn test_register_128_is_rejected() {
        let mut b = new_builder();
        for _ in 0..127 {
            b.new_register(Kind::Int);
        }
        b.new_register(Kind::Int);
    }

    #[test]
    fn test_register_127_is_accepted() {
        let mut b = new_builder();
        let mut last = 0;
        for _ in 0..127 {
            last = b.new_register(Kind::Int);
        }
        assert_eq!(last, 127);
    }

    #[test]
    fn test_constants_round_trip_without_dedup() {
        let mut b = new_builder();
        let i0 = b.make_int_constant(42);
        let i1 = b.make_int_constant(42);
        let f0 = b.make_float_constant(2.5);
        let s0 = b.make_string_constant("hello");
        let g0 = b.make_general_constant(Value::Nil);
        assert_eq!((i0, i1, f0, s0, g0), (0, 1, 0, 0, 0));
        let func = b.end();
        assert_eq!(func.constants.int, vec![42, 42]);
        assert_eq!(func.constants.float, vec![2.5]);
        assert_eq!(func.constants.string, vec!["hello".to_string()]);
        assert_eq!(func.constants.general, vec![Value::Nil]);
    }

    #[test]
    #[should_panic(expected = "int constants limit reached")]
    fn test_int_constant_pool_overflow() {
        let mut b = new_builder();
        for i in 0..257 {
            b.make_int_constant(i);
        }
    }

    #[test]
    fn test_int_constant_pool_holds_256() {
        let mut b = new_builder();
        for i in 0..256 {
            b.make_int_constant(i);
        }
        assert_eq!(b.function().constants.int.len(), 256);
    }

    #[test]
    fn test_interface_constants_use_negative_indices() {
        let mut b = new_builder();
        let g = b.make_general_constant(Value::Int(1));
        assert_eq!(g, 0);
        let i0 = b.make_interface_constant(Value::Int(2));
        let i1 = b.make_interface_constant(Value::Int(3));
        assert_eq!(i0, -2);
        assert_eq!(i1, -3);
        // All three share the general pool.
        assert_eq!(b.function().constants.general.len(), 3);
    }

    #[test]
    #[should_panic(expected = "interface constants limit reached")]
    fn test_interface_constant_129_is_rejected() {
        let mut b = new_builder();
        for i in 0..129 {
            b.make_interface_constant(Value::Int(i));
        }
    }

    #[test]
    fn test_interface_constant_128_is_accepted() {
        let mut b = new_builder();
        let mut last = 0;
        for i in 0..128 {
            last = b.make_interface_constant(Value::Int(i));
        }
        assert_eq!(last, -128);
    }

    #[test]
    fn test_type_table_deduplicates() {
        let mut b = new_builder();
        let t0 = b.add_type(Type::Slice(Box::new(Type::Int)));
        let t1 = b.add_type(Type::Str);
        let t2 = b.add_type(Type::Slice(Box::new(Type::Int)));
        assert_eq!(t0, 0);
        assert_eq!(t1, 1);
        assert_eq!(t2, t0);
        assert_eq!(b.function().types.len(), 2);
    }

    #[test]
    #[should_panic(expected = "types limit reached")]
    fn test_type_table_overflow() {
        let mut b = new_builder();
        for i in 0..257u32 {
            b.add_type(Type::Struct(format!("T{i}")));
        }
    }

    #[test]
    fn test_type_table_holds_256() {
        let mut b = new_builder();
        for i in 0..256u32 {
            b.add_type(Type::Struct(format!("T{i}")));
        }
        assert_eq!(b.function().types.len(), 256);
    }

    #[test]
    #[should_panic(expected = "functions limit reached")]
    fn test_nested_function_overflow() {
        let mut b = new_builder();
        let nested = Arc::new(Function::default());
        for _ in 0..257 {
            b.add_function(Arc::clone(&nested));
        }
    }

    #[test]
    fn test_call_appends_one_auxiliary_word() {
        let mut b = new_builder();
        b.emit_call(0, StackShift([1, 2, 3, 4]), 10);
        let body = &b.function().body;
        assert_eq!(body.len(), 2);
        assert_eq!(body[0].op, Opcode::Call as i8);
        assert_eq!(
            (body[1].op, body[1].a, body[1].b, body[1].c),
            (1, 2, 3, 4)
        );
        // The faulting line indexes the primary word.
        assert_eq!(b.function().lines.get(&0), Some(&10));
    }

    #[test]
    fn test_defer_appends_two_auxiliary_words() {
        let mut b = new_builder();
        b.emit_defer(1, 0, StackShift([1, 1, 1, 1]), StackShift([2, 2, 2, 2]));
        let body = &b.function().body;
        assert_eq!(body.len(), 3);
        assert_eq!(body[0].op, Opcode::Defer as i8);
        assert_eq!(body[1].op, 1);
        assert_eq!(body[2].op, 2);
    }

    #[test]
    fn test_labels_bound_after_multiword_skip_auxiliary_words() {
        let mut b = new_builder();
        let lbl = b.new_label();
        b.emit_goto(lbl);
        b.emit_call(0, StackShift([0, 0, 0, 0]), 1);
        b.set_label_addr(lbl);
        b.emit_nop();
        let func = b.end();
        // Body: goto, call, aux, nop. The label lands on the nop at 3,
        // past the call's auxiliary word.
        assert_eq!(decode_addr_of(func.body[0]), 3);
        assert_eq!(func.body[3].op, Opcode::None as i8);
    }

    #[test]
    fn test_if_rejects_nothing_for_scalar_classes() {
        let mut b = new_builder();
        b.emit_if(false, 1, Condition::Less, 2, Kind::Int);
        b.emit_if(false, 1, Condition::Equal, 2, Kind::Float64);
        b.emit_if(true, 1, Condition::EqualLen, 0, Kind::String);
        let ops: Vec<i8> = b.function().body.iter().map(|i| i.op).collect();
        assert_eq!(
            ops,
            vec![
                Opcode::IfInt as i8,
                Opcode::IfFloat as i8,
                -(Opcode::IfString as i8),
            ]
        );
    }

    #[test]
    #[should_panic(expected = "if: invalid type")]
    fn test_if_rejects_interface_operands() {
        let mut b = new_builder();
        b.emit_if(false, 1, Condition::Equal, 2, Kind::Interface);
    }

    #[test]
    fn test_set_map_operand_order() {
        // m[key] = value emits {a: map, b: value, c: key}.
        let mut b = new_builder();
        b.emit_set_map(false, 3, 1, 2);
        let inst = b.function().body[0];
        assert_eq!((inst.a, inst.b, inst.c), (3, 1, 2));
    }

    #[test]
    fn test_scope_lookup_walks_frames_top_down() {
        let mut b = new_builder();
        b.enter_scope();
        b.bind_var_reg("x", 1);
        b.enter_scope();
        b.bind_var_reg("x", 2);
        assert_eq!(b.scope_lookup("x"), 2);
        assert!(b.is_variable("x"));
        b.exit_scope();
        assert_eq!(b.scope_lookup("x"), 1);
        b.exit_scope();
        assert!(!b.is_variable("x"));
    }

    #[test]
    fn test_debug_information() {
        let mut b = new_builder();
        b.set_file_line("/index.html", 12);
        b.set_closure_refs(vec![3, -1]);
        b.emit_panic(1, 40);
        let func = b.end();
        assert_eq!(func.file, "/index.html");
        assert_eq!(func.line, 12);
        assert_eq!(func.closure_refs, vec![3, -1]);
        assert_eq!(func.lines.get(&0), Some(&40));
    }

    fn decode_addr_of(inst: Instruction) -> u32 {
        super::super::instruction::decode_addr(inst.a, inst.b, inst.c)
    }
}
