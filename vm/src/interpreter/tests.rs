use std::cell::Cell;

use bytecode::{BytecodeBuilder, Cond, MemTy, NumTy, Op};
use object::{
    CallConv, ClassBuilder, ClassId, ClauseKind, DataRef, DefinedClass, ExceptionClause,
    ExceptionKind, FieldId, LoweredBody, MethodFlags, MethodId, MethodSpec, ObjRef, Signature,
    TypeKind, TypeRef,
};

use crate::arglist::ArgIterator;
use crate::config::DomainCreateInfo;
use crate::context::with_context;
use crate::demos;
use crate::error::InvokeError;
use crate::exception::Raise;
use crate::invoke::reenter;
use crate::stackval::StackVal;
use crate::Domain;

fn domain() -> Domain {
    Domain::new(DomainCreateInfo::default()).unwrap()
}

fn define(domain: &Domain, builder: ClassBuilder) -> DefinedClass {
    domain.metadata().define_class(builder).unwrap()
}

fn static_method(name: &str, params: Vec<TypeRef>, ret: TypeRef) -> MethodSpec {
    MethodSpec::new(name, Signature::new(params, ret), MethodFlags::STATIC)
}

fn set_body(domain: &Domain, id: MethodId, body: LoweredBody) {
    domain.metadata().set_body(id, body).unwrap();
}

fn body(code: BytecodeBuilder, max_stack: u32) -> LoweredBody {
    LoweredBody {
        code: code.finish().unwrap(),
        max_stack,
        ..LoweredBody::default()
    }
}

fn read_static(domain: &Domain, field: FieldId) -> i32 {
    let (class, def) = domain.metadata().field(field).unwrap();
    unsafe { class.statics.addr(def.offset).cast::<i32>().read() }
}

fn thrown(domain: &Domain, result: Result<StackVal, InvokeError>) -> ExceptionKind {
    match result {
        Err(InvokeError::Exception(exception)) => domain.exception_kind(exception).unwrap(),
        other => panic!("expected an exception, got {other:?}"),
    }
}

fn primitive(domain: &Domain, kind: TypeKind) -> ClassId {
    domain.metadata().special().primitive_class(kind).unwrap()
}

fn clause(try_range: (usize, usize), handler: (usize, usize), kind: ClauseKind) -> ExceptionClause {
    ExceptionClause {
        try_start: try_range.0 as u32,
        try_end: try_range.1 as u32,
        handler_start: handler.0 as u32,
        handler_end: handler.1 as u32,
        kind,
        exvar_offset: None,
    }
}

// ── basics ─────────────────────────────────────────────────────────

#[test]
fn adds_two_numbers() {
    let domain = domain();
    let demo = demos::arith(&domain).unwrap();
    assert_eq!(domain.invoke(demo.entry, &demo.args).unwrap().as_i32(), 5);
    assert_eq!(domain.stats().calls(), 1);
    assert_eq!(domain.stats().transforms(), 1);
}

#[test]
fn recursion_nests_frames() {
    let domain = domain();
    let demo = demos::fib(&domain, 15).unwrap();
    assert_eq!(domain.invoke(demo.entry, &demo.args).unwrap().as_i32(), 610);
    // The method is transformed once however often it is called.
    assert_eq!(domain.stats().transforms(), 1);
}

#[test]
fn argument_count_is_checked() {
    let domain = domain();
    let demo = demos::arith(&domain).unwrap();
    assert_eq!(
        domain.invoke(demo.entry, &[StackVal::from_i32(1)]),
        Err(InvokeError::ArgumentCount {
            expected: 2,
            found: 1
        })
    );
}

#[test]
fn switch_selects_a_target_or_falls_through() {
    let domain = domain();
    let class = define(
        &domain,
        ClassBuilder::class("Switch").method(static_method("Pick", vec![TypeRef::I4], TypeRef::I4)),
    );
    let mut b = BytecodeBuilder::new();
    let (zero, one) = (b.label(), b.label());
    b.ldarg(0);
    b.switch(&[zero, one]);
    b.ldc_i4(-1);
    b.simple(Op::Ret);
    b.bind(zero);
    b.ldc_i4(100);
    b.simple(Op::Ret);
    b.bind(one);
    b.ldc_i4(200);
    b.simple(Op::Ret);
    set_body(&domain, class.methods[0], body(b, 1));

    let pick = |n| domain.invoke(class.methods[0], &[StackVal::from_i32(n)]).unwrap().as_i32();
    assert_eq!(pick(0), 100);
    assert_eq!(pick(1), 200);
    assert_eq!(pick(2), -1);
    assert_eq!(pick(-1), -1);
}

#[test]
fn jmp_replaces_the_running_method() {
    let domain = domain();
    let class = define(
        &domain,
        ClassBuilder::class("Jumps")
            .method(static_method("Entry", vec![TypeRef::I4], TypeRef::I4))
            .method(static_method("Double", vec![TypeRef::I4], TypeRef::I4)),
    );
    let (entry, double) = (class.methods[0], class.methods[1]);

    let mut b = BytecodeBuilder::new();
    b.jmp(0);
    set_body(
        &domain,
        entry,
        LoweredBody {
            data: vec![DataRef::Method(double)],
            ..body(b, 1)
        },
    );
    let mut b = BytecodeBuilder::new();
    b.ldarg(0);
    b.ldc_i4(2);
    b.arith(Op::Mul, NumTy::I4);
    b.simple(Op::Ret);
    set_body(&domain, double, body(b, 2));

    assert_eq!(domain.invoke(entry, &[StackVal::from_i32(21)]).unwrap().as_i32(), 42);
}

// ── exceptions ─────────────────────────────────────────────────────

#[test]
fn caught_exception_lands_in_the_exception_variable() {
    let domain = domain();
    let class = define(
        &domain,
        ClassBuilder::class("Catcher").method(static_method("Run", vec![TypeRef::I4], TypeRef::OBJECT)),
    );
    let mut b = BytecodeBuilder::new();
    // Junk on the stack must be gone when the handler starts.
    b.ldc_i4(11);
    b.ldc_i4(12);
    b.ldc_i4(1);
    b.ldarg(0);
    b.arith(Op::Div, NumTy::I4);
    b.simple(Op::Ret);
    let handler = b.current_offset();
    b.simple(Op::Pop);
    b.ldloc(MemTy::Ref, 0);
    b.simple(Op::Ret);
    let end = b.current_offset();

    let catch = ExceptionClause {
        exvar_offset: Some(0),
        ..clause(
            (0, handler),
            (handler, end),
            ClauseKind::Catch(domain.metadata().special().exception_class(ExceptionKind::DivideByZero)),
        )
    };
    set_body(
        &domain,
        class.methods[0],
        LoweredBody {
            locals_size: 8,
            clauses: vec![catch],
            ..body(b, 4)
        },
    );

    let exception = domain.invoke(class.methods[0], &[StackVal::from_i32(0)]).unwrap();
    assert_eq!(domain.exception_kind(exception.as_obj()), Some(ExceptionKind::DivideByZero));
    assert_eq!(domain.stats().exceptions(), 1);
}

#[test]
fn unhandled_exceptions_reach_the_entry_point() {
    let domain = domain();
    let demo = demos::arith(&domain).unwrap();
    let class = define(
        &domain,
        ClassBuilder::class("Faulty").method(static_method("Run", vec![], TypeRef::I4)),
    );
    let mut b = BytecodeBuilder::new();
    b.ldc_i4(i32::MAX);
    b.ldc_i4(1);
    b.arith(Op::AddOvf, NumTy::I4);
    b.simple(Op::Ret);
    set_body(&domain, class.methods[0], body(b, 2));

    assert_eq!(thrown(&domain, domain.invoke(class.methods[0], &[])), ExceptionKind::Overflow);
    // The thread is usable afterwards.
    assert!(with_context(|ctx| !ctx.has_resume_state()));
    assert_eq!(domain.invoke(demo.entry, &demo.args).unwrap().as_i32(), 5);
}

#[test]
fn catch_and_finally_run_once() {
    let domain = domain();
    let demo = demos::exceptions(&domain).unwrap();
    // -1 from the catch plus one finally run.
    assert_eq!(domain.invoke(demo.entry, &demo.args).unwrap().as_i32(), 0);
    // Without a fault the finally still runs, on the leave path.
    let ok = domain
        .invoke(demo.entry, &[StackVal::from_i32(8), StackVal::from_i32(2)])
        .unwrap();
    assert_eq!(ok.as_i32(), 4 + 2);
}

#[test]
fn exceptions_unwind_through_callee_finally_blocks() {
    let domain = domain();
    let class = define(
        &domain,
        ClassBuilder::class("Layers")
            .static_field("cleanups", TypeRef::I4)
            .method(static_method("Inner", vec![], TypeRef::VOID))
            .method(static_method("Outer", vec![], TypeRef::I4)),
    );
    let (inner, outer) = (class.methods[0], class.methods[1]);
    let counter = DataRef::StaticField(class.fields[0]);

    let mut b = BytecodeBuilder::new();
    let done = b.label();
    b.ldc_i4(1);
    b.ldc_i4(0);
    b.arith(Op::Div, NumTy::I4);
    b.simple(Op::Pop);
    b.leave(done);
    let finally = b.current_offset();
    b.ldsfld(MemTy::I4, 0);
    b.ldc_i4(1);
    b.arith(Op::Add, NumTy::I4);
    b.stsfld(MemTy::I4, 0);
    b.endfinally(0);
    let finally_end = b.current_offset();
    b.bind(done);
    b.simple(Op::RetVoid);
    set_body(
        &domain,
        inner,
        LoweredBody {
            clauses: vec![clause((0, finally), (finally, finally_end), ClauseKind::Finally)],
            data: vec![counter.clone()],
            ..body(b, 2)
        },
    );

    let mut b = BytecodeBuilder::new();
    let done = b.label();
    b.call(0);
    b.leave(done);
    let handler = b.current_offset();
    b.simple(Op::Pop);
    b.ldc_i4(5);
    b.stloc(MemTy::I4, 0);
    b.leave(done);
    let handler_end = b.current_offset();
    b.bind(done);
    b.ldloc(MemTy::I4, 0);
    b.ldsfld(MemTy::I4, 1);
    b.arith(Op::Add, NumTy::I4);
    b.simple(Op::Ret);
    let div_by_zero = domain.metadata().special().exception_class(ExceptionKind::DivideByZero);
    set_body(
        &domain,
        outer,
        LoweredBody {
            locals_size: 8,
            clauses: vec![clause((0, handler), (handler, handler_end), ClauseKind::Catch(div_by_zero))],
            data: vec![DataRef::Method(inner), counter],
            ..body(b, 2)
        },
    );

    assert_eq!(domain.invoke(outer, &[]).unwrap().as_i32(), 6);
    assert_eq!(read_static(&domain, class.fields[0]), 1);
}

/// `Run(accept)`: divides by zero under a filter that evaluates `accept`.
fn filtered(domain: &Domain) -> MethodId {
    let class = define(
        domain,
        ClassBuilder::class("Filtered").method(static_method("Run", vec![TypeRef::I4], TypeRef::I4)),
    );
    let mut b = BytecodeBuilder::new();
    let done = b.label();
    b.ldc_i4(1);
    b.ldc_i4(0);
    b.arith(Op::Div, NumTy::I4);
    b.simple(Op::Ret);
    let filter = b.current_offset();
    b.simple(Op::Pop);
    b.ldarg(0);
    b.simple(Op::EndFilter);
    let handler = b.current_offset();
    b.simple(Op::Pop);
    b.leave(done);
    let handler_end = b.current_offset();
    b.bind(done);
    b.ldc_i4(77);
    b.simple(Op::Ret);
    set_body(
        domain,
        class.methods[0],
        LoweredBody {
            clauses: vec![clause(
                (0, filter),
                (handler, handler_end),
                ClauseKind::Filter {
                    filter_start: filter as u32,
                },
            )],
            ..body(b, 2)
        },
    );
    class.methods[0]
}

#[test]
fn filters_decide_whether_a_handler_runs() {
    let domain = domain();
    let run = filtered(&domain);
    assert_eq!(domain.invoke(run, &[StackVal::from_i32(1)]).unwrap().as_i32(), 77);
    assert_eq!(
        thrown(&domain, domain.invoke(run, &[StackVal::from_i32(0)])),
        ExceptionKind::DivideByZero
    );
}

fn request_interruption(_: &Domain, _: &[StackVal], _: &mut StackVal) -> Result<(), Raise> {
    with_context(|ctx| ctx.interrupt_handle().interrupt());
    Ok(())
}

#[test]
fn nested_finally_blocks_run_innermost_first_and_defer_interruption() {
    let domain = domain();
    let class = define(
        &domain,
        ClassBuilder::class("Nested")
            .static_field("trail", TypeRef::I4)
            .method(static_method("Run", vec![], TypeRef::VOID))
            .method(MethodSpec::new(
                "Interrupt",
                Signature::new(vec![], TypeRef::VOID),
                MethodFlags::STATIC | MethodFlags::INTERNAL_CALL,
            )),
    );
    let (run, interrupt) = (class.methods[0], class.methods[1]);
    domain.register_internal(interrupt, request_interruption);

    // trail = trail * 10 + digit
    let append = |b: &mut BytecodeBuilder, digit: i32| {
        b.ldsfld(MemTy::I4, 0);
        b.ldc_i4(10);
        b.arith(Op::Mul, NumTy::I4);
        b.ldc_i4(digit);
        b.arith(Op::Add, NumTy::I4);
        b.stsfld(MemTy::I4, 0);
    };
    let mut b = BytecodeBuilder::new();
    let done = b.label();
    b.leave(done);
    let inner_finally = b.current_offset();
    b.call(1);
    append(&mut b, 1);
    b.endfinally(0);
    let outer_finally = b.current_offset();
    append(&mut b, 2);
    b.endfinally(1);
    let end = b.current_offset();
    b.bind(done);
    append(&mut b, 3);
    b.simple(Op::RetVoid);
    set_body(
        &domain,
        run,
        LoweredBody {
            clauses: vec![
                clause((0, inner_finally), (inner_finally, outer_finally), ClauseKind::Finally),
                clause((0, outer_finally), (outer_finally, end), ClauseKind::Finally),
            ],
            data: vec![DataRef::StaticField(class.fields[0]), DataRef::Method(interrupt)],
            ..body(b, 2)
        },
    );

    // The interruption requested inside the first finally surfaces only
    // once both have run, before the code after the leave.
    assert_eq!(thrown(&domain, domain.invoke(run, &[])), ExceptionKind::ThreadInterrupted);
    assert_eq!(read_static(&domain, class.fields[0]), 12);
    assert!(with_context(|ctx| !ctx.is_abort_protected()));
}

#[test]
fn checked_leave_polls_for_interruption() {
    let domain = domain();
    let class = define(
        &domain,
        ClassBuilder::class("Polling").method(static_method("Run", vec![], TypeRef::I4)),
    );
    let mut b = BytecodeBuilder::new();
    let done = b.label();
    b.leave_check(done);
    b.bind(done);
    b.ldc_i4(1);
    b.simple(Op::Ret);
    set_body(&domain, class.methods[0], body(b, 1));

    assert_eq!(domain.invoke(class.methods[0], &[]).unwrap().as_i32(), 1);
    let handle = with_context(|ctx| ctx.interrupt_handle());
    handle.interrupt();
    assert_eq!(
        thrown(&domain, domain.invoke(class.methods[0], &[])),
        ExceptionKind::ThreadInterrupted
    );
    assert!(!handle.is_pending());
}

// ── arrays and objects ─────────────────────────────────────────────

#[test]
fn vector_access_is_bounds_checked() {
    let domain = domain();
    let int_array = domain.metadata().array_class(TypeRef::I4, 1, true).unwrap();
    let class = define(
        &domain,
        ClassBuilder::class("Vectors").method(static_method("At", vec![TypeRef::I4], TypeRef::I4)),
    );
    let mut b = BytecodeBuilder::new();
    b.ldc_i4(3);
    b.newarr(0);
    b.stloc(MemTy::Ref, 0);
    b.ldloc(MemTy::Ref, 0);
    b.ldc_i4(2);
    b.ldc_i4(40);
    b.stelem(MemTy::I4, true);
    b.ldloc(MemTy::Ref, 0);
    b.ldarg(0);
    b.ldelem(MemTy::I4, true);
    b.ldloc(MemTy::Ref, 0);
    b.simple(Op::LdLen);
    b.conv(NumTy::I8, bytecode::ConvTy::I4);
    b.arith(Op::Add, NumTy::I4);
    b.simple(Op::Ret);
    set_body(
        &domain,
        class.methods[0],
        LoweredBody {
            locals_size: 8,
            data: vec![DataRef::Class(int_array)],
            ..body(b, 3)
        },
    );

    let at = |i| domain.invoke(class.methods[0], &[StackVal::from_i32(i)]);
    assert_eq!(at(2).unwrap().as_i32(), 43);
    assert_eq!(at(0).unwrap().as_i32(), 3);
    assert_eq!(thrown(&domain, at(3)), ExceptionKind::IndexOutOfRange);
    assert_eq!(thrown(&domain, at(-1)), ExceptionKind::IndexOutOfRange);
}

#[test]
fn negative_array_length_overflows() {
    let domain = domain();
    let int_array = domain.metadata().array_class(TypeRef::I4, 1, true).unwrap();
    let class = define(
        &domain,
        ClassBuilder::class("BadLength").method(static_method("Run", vec![], TypeRef::OBJECT)),
    );
    let mut b = BytecodeBuilder::new();
    b.ldc_i4(-1);
    b.newarr(0);
    b.simple(Op::Ret);
    set_body(
        &domain,
        class.methods[0],
        LoweredBody {
            data: vec![DataRef::Class(int_array)],
            ..body(b, 1)
        },
    );
    assert_eq!(thrown(&domain, domain.invoke(class.methods[0], &[])), ExceptionKind::Overflow);
}

#[test]
fn multi_dimensional_arrays_honor_lower_bounds() {
    let domain = domain();
    let matrix = domain.metadata().array_class(TypeRef::I4, 2, false).unwrap();
    let class = define(
        &domain,
        ClassBuilder::class("Matrix")
            .method(static_method("Get", vec![TypeRef::I4, TypeRef::I4], TypeRef::I4)),
    );
    let mut b = BytecodeBuilder::new();
    // lower bounds 1, 1; lengths 2, 3
    b.ldc_i4(1);
    b.ldc_i4(1);
    b.ldc_i4(2);
    b.ldc_i4(3);
    b.newarr_multi(0, 4);
    b.stloc(MemTy::Ref, 0);
    b.ldloc(MemTy::Ref, 0);
    b.ldc_i4(2);
    b.ldc_i4(3);
    b.ldc_i4(7);
    b.md_array_set(2, MemTy::I4);
    b.ldloc(MemTy::Ref, 0);
    b.ldarg(0);
    b.ldarg(1);
    b.md_array_get(2, MemTy::I4, true);
    b.simple(Op::Ret);
    set_body(
        &domain,
        class.methods[0],
        LoweredBody {
            locals_size: 8,
            data: vec![DataRef::Class(matrix)],
            ..body(b, 4)
        },
    );

    let get = |i, j| domain.invoke(class.methods[0], &[StackVal::from_i32(i), StackVal::from_i32(j)]);
    assert_eq!(get(2, 3).unwrap().as_i32(), 7);
    assert_eq!(get(1, 1).unwrap().as_i32(), 0);
    assert_eq!(thrown(&domain, get(0, 1)), ExceptionKind::IndexOutOfRange);
    assert_eq!(thrown(&domain, get(1, 4)), ExceptionKind::IndexOutOfRange);
}

#[test]
fn covariant_reference_stores_are_type_checked() {
    let domain = domain();
    let meta = domain.metadata();
    let string_array = meta.array_class(TypeRef::STRING, 1, true).unwrap();
    let class = define(
        &domain,
        ClassBuilder::class("Covariance").method(static_method("Store", vec![TypeRef::OBJECT], TypeRef::VOID)),
    );
    let mut b = BytecodeBuilder::new();
    b.ldc_i4(1);
    b.newarr(0);
    b.ldc_i4(0);
    b.ldarg(0);
    b.simple(Op::StElemRef);
    b.simple(Op::RetVoid);
    set_body(
        &domain,
        class.methods[0],
        LoweredBody {
            data: vec![DataRef::Class(string_array)],
            ..body(b, 3)
        },
    );

    let text = domain.new_string("fits").unwrap();
    assert!(domain.invoke(class.methods[0], &[StackVal::from_obj(text)]).is_ok());
    let exception = domain.create_exception(ExceptionKind::Overflow);
    assert_eq!(
        thrown(&domain, domain.invoke(class.methods[0], &[StackVal::from_obj(exception)])),
        ExceptionKind::ArrayTypeMismatch
    );
    assert!(domain.invoke(class.methods[0], &[StackVal::from_obj(ObjRef::NULL)]).is_ok());
}

#[test]
fn boxing_round_trips_and_casts_check_types() {
    let domain = domain();
    let int32 = primitive(&domain, TypeKind::I4);
    let class = define(
        &domain,
        ClassBuilder::class("Boxes")
            .method(static_method("RoundTrip", vec![TypeRef::I4], TypeRef::I4))
            .method(static_method("Cast", vec![TypeRef::OBJECT], TypeRef::OBJECT))
            .method(static_method("Is", vec![TypeRef::OBJECT], TypeRef::I4)),
    );
    let data = || vec![DataRef::Class(int32)];

    let mut b = BytecodeBuilder::new();
    b.ldarg(0);
    b.box_(0);
    b.unbox(0);
    b.ldind(MemTy::I4, true);
    b.ldc_i4(1);
    b.arith(Op::Add, NumTy::I4);
    b.simple(Op::Ret);
    set_body(&domain, class.methods[0], LoweredBody { data: data(), ..body(b, 2) });

    let mut b = BytecodeBuilder::new();
    b.ldarg(0);
    b.castclass(0);
    b.simple(Op::Ret);
    set_body(&domain, class.methods[1], LoweredBody { data: data(), ..body(b, 1) });

    let mut b = BytecodeBuilder::new();
    b.ldarg(0);
    b.isinst(0);
    b.simple(Op::LdNull);
    b.compare(Cond::NeUn, NumTy::I8);
    b.simple(Op::Ret);
    set_body(&domain, class.methods[2], LoweredBody { data: data(), ..body(b, 2) });

    assert_eq!(domain.invoke(class.methods[0], &[StackVal::from_i32(41)]).unwrap().as_i32(), 42);

    let boxed = domain.invoke(class.methods[1], &[StackVal::from_obj(ObjRef::NULL)]).unwrap();
    assert!(boxed.as_obj().is_null());
    let text = StackVal::from_obj(domain.new_string("no").unwrap());
    assert_eq!(thrown(&domain, domain.invoke(class.methods[1], &[text])), ExceptionKind::InvalidCast);
    assert_eq!(domain.invoke(class.methods[2], &[text]).unwrap().as_i32(), 0);
}

#[test]
fn typed_references_carry_their_class() {
    let domain = domain();
    let int32 = primitive(&domain, TypeKind::I4);
    let int64 = primitive(&domain, TypeKind::I8);
    let class = define(
        &domain,
        ClassBuilder::class("TypedRefs").method(static_method("Deref", vec![TypeRef::I4, TypeRef::I4], TypeRef::I4)),
    );
    let mut b = BytecodeBuilder::new();
    let wrong = b.label();
    b.ldarga(0);
    b.mkrefany(0);
    b.ldarg(1);
    b.brtrue(NumTy::I4, wrong, true);
    b.refanyval(0);
    b.ldind(MemTy::I4, true);
    b.simple(Op::Ret);
    b.bind(wrong);
    b.refanyval(1);
    b.ldind(MemTy::I4, true);
    b.simple(Op::Ret);
    set_body(
        &domain,
        class.methods[0],
        LoweredBody {
            vt_stack_size: 24,
            data: vec![DataRef::Class(int32), DataRef::Class(int64)],
            ..body(b, 2)
        },
    );

    let deref = |wrong| domain.invoke(class.methods[0], &[StackVal::from_i32(9), StackVal::from_i32(wrong)]);
    assert_eq!(deref(0).unwrap().as_i32(), 9);
    assert_eq!(thrown(&domain, deref(1)), ExceptionKind::InvalidCast);
}

#[test]
fn localloc_memory_is_zeroed_and_writable() {
    let domain = domain();
    let class = define(
        &domain,
        ClassBuilder::class("Scratch").method(static_method("Run", vec![], TypeRef::I4)),
    );
    let mut b = BytecodeBuilder::new();
    b.ldc_i4(16);
    b.simple(Op::LocAlloc);
    b.simple(Op::Dup);
    b.simple(Op::Dup);
    b.ldind(MemTy::I4, true);
    b.ldc_i4(5);
    b.arith(Op::Add, NumTy::I4);
    b.stind(MemTy::I4);
    b.ldind(MemTy::I4, true);
    b.simple(Op::Ret);
    set_body(&domain, class.methods[0], body(b, 4));
    assert_eq!(domain.invoke(class.methods[0], &[]).unwrap().as_i32(), 5);
}

#[test]
fn null_field_access_throws() {
    let domain = domain();
    let holder = define(&domain, ClassBuilder::class("Holder").field("value", TypeRef::I4));
    let offset = domain.metadata().field(holder.fields[0]).unwrap().1.offset as u16;
    let class = define(
        &domain,
        ClassBuilder::class("Reader").method(static_method("Read", vec![TypeRef::OBJECT], TypeRef::I4)),
    );
    let mut b = BytecodeBuilder::new();
    b.ldarg(0);
    b.ldfld(MemTy::I4, offset);
    b.simple(Op::Ret);
    set_body(&domain, class.methods[0], body(b, 1));

    assert_eq!(
        thrown(&domain, domain.invoke(class.methods[0], &[StackVal::from_obj(ObjRef::NULL)])),
        ExceptionKind::NullReference
    );
    let obj = domain
        .heap()
        .alloc_object(&domain.metadata().class(holder.id).unwrap())
        .unwrap();
    unsafe { obj.as_ptr().add(offset as usize).cast::<i32>().write(31) };
    assert_eq!(domain.invoke(class.methods[0], &[StackVal::from_obj(obj)]).unwrap().as_i32(), 31);
}

// ── calls ──────────────────────────────────────────────────────────

#[test]
fn interface_dispatch_resolves_once() {
    let domain = domain();
    let demo = demos::dispatch(&domain, 10).unwrap();
    assert_eq!(domain.invoke(demo.entry, &demo.args).unwrap().as_i32(), 90);
    let dispatch = &domain.stats().dispatch;
    assert_eq!(dispatch.resolutions(), 1);
    assert_eq!(dispatch.cache_hits(), 9);
}

fn sum_varargs(domain: &Domain, args: &[StackVal], ret: &mut StackVal) -> Result<(), Raise> {
    let mut varargs = unsafe { ArgIterator::new(args[0]) };
    let mut total = 0i64;
    while let Some(arg) = varargs.next_arg(domain.metadata()) {
        let (_, value) = arg.map_err(|_| Raise::Kind(ExceptionKind::ExecutionEngine))?;
        total += value.as_i64();
    }
    *ret = StackVal::from_i64(total);
    Ok(())
}

#[test]
fn vararg_calls_pass_an_argument_list() {
    let domain = domain();
    let class = define(
        &domain,
        ClassBuilder::class("Varargs")
            .method(MethodSpec::new(
                "Sum",
                Signature {
                    call_conv: CallConv::VarArg,
                    ..Signature::new(vec![], TypeRef::I8)
                },
                MethodFlags::STATIC,
            ))
            .method(MethodSpec::new(
                "SumList",
                Signature::new(vec![TypeRef::I], TypeRef::I8),
                MethodFlags::STATIC | MethodFlags::INTERNAL_CALL,
            ))
            .method(static_method("Caller", vec![], TypeRef::I8)),
    );
    let (sum, sum_list, caller) = (class.methods[0], class.methods[1], class.methods[2]);
    domain.register_internal(sum_list, sum_varargs);

    let mut b = BytecodeBuilder::new();
    b.simple(Op::ArgList);
    b.call(0);
    b.simple(Op::Ret);
    set_body(
        &domain,
        sum,
        LoweredBody {
            data: vec![DataRef::Method(sum_list)],
            ..body(b, 1)
        },
    );

    let site = Signature::new(vec![TypeRef::I4, TypeRef::I1, TypeRef::I8], TypeRef::I8).vararg_call(0);
    let mut b = BytecodeBuilder::new();
    b.ldc_i4(1);
    b.ldc_i4(-2);
    b.ldc_i8(1 << 40);
    b.call_vararg(0, 1);
    b.simple(Op::Ret);
    set_body(
        &domain,
        caller,
        LoweredBody {
            vt_stack_size: 32,
            data: vec![DataRef::Method(sum), DataRef::Signature(site.into())],
            ..body(b, 3)
        },
    );

    assert_eq!(domain.invoke(caller, &[]).unwrap().as_i64(), (1 << 40) - 1);
}

#[test]
fn missing_internal_calls_are_not_supported() {
    let domain = domain();
    let class = define(
        &domain,
        ClassBuilder::class("Unbound").method(MethodSpec::new(
            "Missing",
            Signature::new(vec![], TypeRef::VOID),
            MethodFlags::STATIC | MethodFlags::INTERNAL_CALL,
        )),
    );
    assert_eq!(thrown(&domain, domain.invoke(class.methods[0], &[])), ExceptionKind::NotSupported);
}

#[test]
fn calls_through_function_pointers() {
    let domain = domain();
    let demo = demos::arith(&domain).unwrap();
    let class = define(
        &domain,
        ClassBuilder::class("Pointers").method(static_method("Run", vec![], TypeRef::I4)),
    );
    let mut b = BytecodeBuilder::new();
    b.ldc_i4(20);
    b.ldc_i4(22);
    b.ldftn(0);
    b.calli(1);
    b.simple(Op::Ret);
    set_body(
        &domain,
        class.methods[0],
        LoweredBody {
            data: vec![
                DataRef::Method(demo.entry),
                DataRef::Signature(Signature::new(vec![TypeRef::I4, TypeRef::I4], TypeRef::I4).into()),
            ],
            ..body(b, 3)
        },
    );
    assert_eq!(domain.invoke(class.methods[0], &[]).unwrap().as_i32(), 42);
}

unsafe extern "C" fn compiled_double(args: *const *mut u8, ret: *mut u8, _exc: *mut ObjRef) {
    unsafe {
        let value = (*args).cast::<i32>().read();
        ret.cast::<i32>().write(value * 2);
    }
}

thread_local! {
    static REENTRY_TARGET: Cell<Option<MethodId>> = const { Cell::new(None) };
}

/// Adds 10 to its argument by re-entering the interpreter.
unsafe extern "C" fn compiled_reentrant(args: *const *mut u8, ret: *mut u8, exc: *mut ObjRef) {
    let target = REENTRY_TARGET.with(Cell::get).unwrap();
    let mut ten = 10i32;
    unsafe {
        let inner = [*args, (&raw mut ten).cast::<u8>()];
        if let Err(InvokeError::Exception(exception)) = reenter(target, inner.as_ptr(), ret) {
            *exc = exception;
        }
    }
}

#[test]
fn compiled_methods_are_called_and_can_reenter() {
    let domain = domain();
    let add = demos::arith(&domain).unwrap().entry;
    let class = define(
        &domain,
        ClassBuilder::class("Compiled")
            .method(static_method("Double", vec![TypeRef::I4], TypeRef::I4))
            .method(static_method("AddTen", vec![TypeRef::I4], TypeRef::I4))
            .method(static_method("Run", vec![TypeRef::I4], TypeRef::I4)),
    );
    let (double, add_ten, run) = (class.methods[0], class.methods[1], class.methods[2]);
    domain.metadata().set_compiled(double, compiled_double).unwrap();
    domain.metadata().set_compiled(add_ten, compiled_reentrant).unwrap();
    REENTRY_TARGET.with(|target| target.set(Some(add)));

    let mut b = BytecodeBuilder::new();
    b.ldarg(0);
    b.call(0);
    b.call(1);
    b.simple(Op::Ret);
    set_body(
        &domain,
        run,
        LoweredBody {
            data: vec![DataRef::Method(double), DataRef::Method(add_ten)],
            ..body(b, 1)
        },
    );

    // (4 * 2) + 10
    assert_eq!(domain.invoke(run, &[StackVal::from_i32(4)]).unwrap().as_i32(), 18);
}

#[test]
fn reentry_needs_an_active_domain() {
    let mut ret = 0i32;
    let result = unsafe { reenter(MethodId(0), std::ptr::null(), (&raw mut ret).cast()) };
    assert_eq!(result, Err(InvokeError::NoDomain));
}

fn monitor_probe(domain: &Domain, _: &[StackVal], ret: &mut StackVal) -> Result<(), Raise> {
    let class = domain.metadata().find_class("Locked").unwrap();
    *ret = StackVal::from_bool(domain.monitors.for_class(class).is_held_by_current_thread());
    Ok(())
}

#[test]
fn synchronized_methods_hold_the_class_monitor() {
    let domain = domain();
    let class = define(
        &domain,
        ClassBuilder::class("Locked")
            .method(MethodSpec::new(
                "Guarded",
                Signature::new(vec![], TypeRef::BOOLEAN),
                MethodFlags::STATIC | MethodFlags::SYNCHRONIZED,
            ))
            .method(MethodSpec::new(
                "Probe",
                Signature::new(vec![], TypeRef::BOOLEAN),
                MethodFlags::STATIC | MethodFlags::INTERNAL_CALL,
            )),
    );
    let (guarded, probe) = (class.methods[0], class.methods[1]);
    domain.register_internal(probe, monitor_probe);
    let mut b = BytecodeBuilder::new();
    b.call(0);
    b.simple(Op::Ret);
    set_body(
        &domain,
        guarded,
        LoweredBody {
            data: vec![DataRef::Method(probe)],
            ..body(b, 1)
        },
    );

    assert_eq!(domain.invoke(guarded, &[]).unwrap().as_i32(), 1);
    assert_eq!(domain.invoke(probe, &[]).unwrap().as_i32(), 0);
}

#[test]
fn invalid_bodies_throw_invalid_program() {
    let domain = domain();
    let class = define(
        &domain,
        ClassBuilder::class("Broken").method(static_method("Run", vec![], TypeRef::VOID)),
    );
    set_body(
        &domain,
        class.methods[0],
        LoweredBody {
            code: vec![0xff],
            ..LoweredBody::default()
        },
    );
    assert_eq!(thrown(&domain, domain.invoke(class.methods[0], &[])), ExceptionKind::InvalidProgram);
}
