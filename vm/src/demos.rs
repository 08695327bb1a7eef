//! Sample programs, assembled directly into lowered bytecode.
//!
//! Used by the `ilvm` binary and the benchmarks to exercise the
//! interpreter without a front end.

use std::fmt;

use bytecode::{BuildError, BytecodeBuilder, Cond, MemTy, NumTy, Op};
use object::{
    ClassBuilder, ClauseKind, DataRef, ExceptionClause, ExceptionKind, LoweredBody,
    MetadataError, MethodFlags, MethodId, MethodSpec, Signature, TypeRef,
};

use crate::Domain;
use crate::stackval::StackVal;

pub const NAMES: &[&str] = &["arith", "fib", "exceptions", "dispatch"];

#[derive(Debug, Clone, PartialEq)]
pub enum DemoError {
    UnknownDemo(String),
    Build(BuildError),
    Metadata(MetadataError),
}

impl fmt::Display for DemoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DemoError::UnknownDemo(name) => {
                write!(f, "unknown demo `{name}` (expected one of {})", NAMES.join(", "))
            }
            DemoError::Build(err) => write!(f, "{err}"),
            DemoError::Metadata(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DemoError {}

impl From<BuildError> for DemoError {
    fn from(err: BuildError) -> Self {
        DemoError::Build(err)
    }
}

impl From<MetadataError> for DemoError {
    fn from(err: MetadataError) -> Self {
        DemoError::Metadata(err)
    }
}

/// A program installed into a domain, ready to invoke.
#[derive(Debug, Clone)]
pub struct Demo {
    pub name: &'static str,
    pub entry: MethodId,
    pub args: Vec<StackVal>,
    /// What `entry` returns, as an `i32`.
    pub expected: i32,
}

/// Define the classes of demo `name` in `domain`.
pub fn install(domain: &Domain, name: &str) -> Result<Demo, DemoError> {
    match name {
        "arith" => arith(domain),
        "fib" => fib(domain, 20),
        "exceptions" => exceptions(domain),
        "dispatch" => dispatch(domain, 1000),
        _ => Err(DemoError::UnknownDemo(name.to_owned())),
    }
}

fn lowered(
    code: BytecodeBuilder,
    max_stack: u32,
    locals_size: u32,
    clauses: Vec<ExceptionClause>,
    data: Vec<DataRef>,
) -> Result<LoweredBody, DemoError> {
    Ok(LoweredBody {
        code: code.finish()?,
        max_stack,
        vt_stack_size: 0,
        locals_size,
        clauses,
        data,
    })
}

fn static_method(name: &str, params: Vec<TypeRef>, ret: TypeRef) -> MethodSpec {
    MethodSpec::new(name, Signature::new(params, ret), MethodFlags::STATIC)
}

/// `Add(2, 3)`.
pub fn arith(domain: &Domain) -> Result<Demo, DemoError> {
    let meta = domain.metadata();
    let class = meta.define_class(
        ClassBuilder::class("Arith").method(static_method(
            "Add",
            vec![TypeRef::I4, TypeRef::I4],
            TypeRef::I4,
        )),
    )?;
    let add = class.methods[0];

    let mut b = BytecodeBuilder::new();
    b.ldarg(0);
    b.ldarg(1);
    b.arith(Op::Add, NumTy::I4);
    b.simple(Op::Ret);
    meta.set_body(add, lowered(b, 2, 0, vec![], vec![])?)?;

    Ok(Demo {
        name: "arith",
        entry: add,
        args: vec![StackVal::from_i32(2), StackVal::from_i32(3)],
        expected: 5,
    })
}

fn fib_of(n: i32) -> i32 {
    if n < 2 { n } else { fib_of(n - 1) + fib_of(n - 2) }
}

/// Doubly recursive `Fib(n)`.
pub fn fib(domain: &Domain, n: i32) -> Result<Demo, DemoError> {
    let meta = domain.metadata();
    let class = meta.define_class(
        ClassBuilder::class("Fibonacci").method(static_method("Fib", vec![TypeRef::I4], TypeRef::I4)),
    )?;
    let fib = class.methods[0];

    let mut b = BytecodeBuilder::new();
    let small = b.label();
    b.ldarg(0);
    b.ldc_i4(2);
    b.bcmp(Cond::Lt, NumTy::I4, small, true);
    b.ldarg(0);
    b.ldc_i4(1);
    b.arith(Op::Sub, NumTy::I4);
    b.call(0);
    b.ldarg(0);
    b.ldc_i4(2);
    b.arith(Op::Sub, NumTy::I4);
    b.call(0);
    b.arith(Op::Add, NumTy::I4);
    b.simple(Op::Ret);
    b.bind(small);
    b.ldarg(0);
    b.simple(Op::Ret);
    meta.set_body(fib, lowered(b, 3, 0, vec![], vec![DataRef::Method(fib)])?)?;

    Ok(Demo {
        name: "fib",
        entry: fib,
        args: vec![StackVal::from_i32(n)],
        expected: fib_of(n),
    })
}

/// `Divide(7, 0)`: a caught division by zero inside a try/finally that
/// counts its runs in a static field. Returns the catch result plus the
/// counter.
pub fn exceptions(domain: &Domain) -> Result<Demo, DemoError> {
    let meta = domain.metadata();
    let class = meta.define_class(
        ClassBuilder::class("Guarded")
            .static_field("finallyRuns", TypeRef::I4)
            .method(static_method("Divide", vec![TypeRef::I4, TypeRef::I4], TypeRef::I4)),
    )?;
    let divide = class.methods[0];
    let divide_by_zero = meta.special().exception_class(ExceptionKind::DivideByZero);

    let mut b = BytecodeBuilder::new();
    let end = b.label();
    // try
    b.ldarg(0);
    b.ldarg(1);
    b.arith(Op::Div, NumTy::I4);
    b.stloc(MemTy::I4, 0);
    b.leave(end);
    // catch (DivideByZeroException)
    let catch_start = b.current_offset() as u32;
    b.simple(Op::Pop);
    b.ldc_i4(-1);
    b.stloc(MemTy::I4, 0);
    b.leave(end);
    // finally
    let finally_start = b.current_offset() as u32;
    b.ldsfld(MemTy::I4, 0);
    b.ldc_i4(1);
    b.arith(Op::Add, NumTy::I4);
    b.stsfld(MemTy::I4, 0);
    b.endfinally(1);
    let finally_end = b.current_offset() as u32;
    b.bind(end);
    b.ldloc(MemTy::I4, 0);
    b.ldsfld(MemTy::I4, 0);
    b.arith(Op::Add, NumTy::I4);
    b.simple(Op::Ret);

    let clauses = vec![
        ExceptionClause {
            try_start: 0,
            try_end: catch_start,
            handler_start: catch_start,
            handler_end: finally_start,
            kind: ClauseKind::Catch(divide_by_zero),
            exvar_offset: None,
        },
        ExceptionClause {
            try_start: 0,
            try_end: finally_start,
            handler_start: finally_start,
            handler_end: finally_end,
            kind: ClauseKind::Finally,
            exvar_offset: None,
        },
    ];
    let data = vec![DataRef::StaticField(class.fields[0])];
    meta.set_body(divide, lowered(b, 2, 8, clauses, data)?)?;

    Ok(Demo {
        name: "exceptions",
        entry: divide,
        args: vec![StackVal::from_i32(7), StackVal::from_i32(0)],
        expected: 0,
    })
}

/// Sum the area of a square through an interface call `n` times.
pub fn dispatch(domain: &Domain, n: i32) -> Result<Demo, DemoError> {
    let meta = domain.metadata();
    let shape = meta.define_class(ClassBuilder::interface("IShape").method(MethodSpec::new(
        "Area",
        Signature::instance(vec![], TypeRef::I4),
        MethodFlags::VIRTUAL | MethodFlags::ABSTRACT,
    )))?;
    let square = meta.define_class(
        ClassBuilder::class("Square")
            .implements(shape.id)
            .field("side", TypeRef::I4)
            .method(MethodSpec::new(
                ".ctor",
                Signature::instance(vec![TypeRef::I4], TypeRef::VOID),
                MethodFlags::CTOR,
            ))
            .method(MethodSpec::new(
                "Area",
                Signature::instance(vec![], TypeRef::I4),
                MethodFlags::VIRTUAL,
            )),
    )?;
    let shapes = meta.define_class(
        ClassBuilder::class("Shapes").method(static_method("SumAreas", vec![TypeRef::I4], TypeRef::I4)),
    )?;
    let (ctor, area, sum_areas) = (square.methods[0], square.methods[1], shapes.methods[0]);
    let side = meta.field(square.fields[0])?.1.offset as u16;

    let mut b = BytecodeBuilder::new();
    b.ldarg(0);
    b.ldarg(1);
    b.stfld(MemTy::I4, side);
    b.simple(Op::RetVoid);
    meta.set_body(ctor, lowered(b, 2, 0, vec![], vec![])?)?;

    let mut b = BytecodeBuilder::new();
    b.ldarg(0);
    b.ldfld(MemTy::I4, side);
    b.ldarg(0);
    b.ldfld(MemTy::I4, side);
    b.arith(Op::Mul, NumTy::I4);
    b.simple(Op::Ret);
    meta.set_body(area, lowered(b, 2, 0, vec![], vec![])?)?;

    // locals: square @0, i @8, sum @12
    let mut b = BytecodeBuilder::new();
    let head = b.label();
    let done = b.label();
    b.ldc_i4(3);
    b.newobj(0);
    b.stloc(MemTy::Ref, 0);
    b.ldc_i4(0);
    b.stloc(MemTy::I4, 8);
    b.ldc_i4(0);
    b.stloc(MemTy::I4, 12);
    b.bind(head);
    b.ldloc(MemTy::I4, 8);
    b.ldarg(0);
    b.bcmp(Cond::Ge, NumTy::I4, done, true);
    b.ldloc(MemTy::I4, 12);
    b.ldloc(MemTy::Ref, 0);
    b.callvirt(1);
    b.arith(Op::Add, NumTy::I4);
    b.stloc(MemTy::I4, 12);
    b.ldloc(MemTy::I4, 8);
    b.ldc_i4(1);
    b.arith(Op::Add, NumTy::I4);
    b.stloc(MemTy::I4, 8);
    b.simple(Op::Safepoint);
    b.br(head);
    b.bind(done);
    b.ldloc(MemTy::I4, 12);
    b.simple(Op::Ret);
    let data = vec![DataRef::Method(ctor), DataRef::Method(shape.methods[0])];
    meta.set_body(sum_areas, lowered(b, 2, 16, vec![], data)?)?;

    Ok(Demo {
        name: "dispatch",
        entry: sum_areas,
        args: vec![StackVal::from_i32(n)],
        expected: 9 * n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainCreateInfo;

    #[test]
    fn every_demo_returns_its_expected_value() {
        for &name in NAMES {
            let domain = Domain::new(DomainCreateInfo::default()).unwrap();
            let demo = install(&domain, name).unwrap();
            let result = domain.invoke(demo.entry, &demo.args).unwrap();
            assert_eq!(result.as_i32(), demo.expected, "{name}");
        }
    }

    #[test]
    fn unknown_demos_are_reported() {
        let domain = Domain::new(DomainCreateInfo::default()).unwrap();
        let err = install(&domain, "nope").unwrap_err();
        assert_eq!(err, DemoError::UnknownDemo("nope".to_owned()));
        assert!(err.to_string().contains("arith"));
    }
}
