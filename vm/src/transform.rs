use object::DataRef;

use bytecode::BytecodeDecoder;

use crate::Domain;
use crate::error::TransformError;
use crate::method::{DataItem, InterpMethod, MethodCode};

/// Produces the executable code of a method.
///
/// Called at most once per successful transform of a descriptor; racing
/// threads may both call it, and the first result wins.
pub trait Transformer: Send + Sync {
    fn transform(&self, domain: &Domain, imethod: &InterpMethod) -> Result<MethodCode, TransformError>;
}

/// Takes the method's pre-lowered body, checks that it decodes and resolves
/// its data items.
///
/// Bodies arrive already optimized, so the `inline` and `cprop` options
/// have nothing left to do here.
#[derive(Debug, Default)]
pub struct LoweredBodyTransformer;

impl Transformer for LoweredBodyTransformer {
    fn transform(&self, domain: &Domain, imethod: &InterpMethod) -> Result<MethodCode, TransformError> {
        let meta = domain.metadata();
        let body = meta
            .lowered_body(&imethod.method)
            .ok_or_else(|| TransformError::NoBody {
                method: imethod.full_name(),
            })?;

        let mut decoder = BytecodeDecoder::new(&body.code);
        while !decoder.is_at_end() {
            decoder.decode().map_err(|error| TransformError::Decode {
                method: imethod.full_name(),
                error,
            })?;
        }
        let len = body.code.len() as u32;
        for (index, clause) in body.clauses.iter().enumerate() {
            if clause.try_end > len || clause.handler_end > len {
                return Err(TransformError::ClauseOutOfRange {
                    method: imethod.full_name(),
                    clause: index,
                });
            }
        }

        let data = body
            .data
            .iter()
            .map(|item| resolve(domain, item))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MethodCode {
            bytes: body.code.clone(),
            stack_cells: body.max_stack as usize + 2,
            vt_stack_size: (body.vt_stack_size as usize).next_multiple_of(8),
            locals_size: (body.locals_size as usize).next_multiple_of(8),
            clauses: body.clauses.clone(),
            data,
        })
    }
}

fn resolve(domain: &Domain, item: &DataRef) -> Result<DataItem, TransformError> {
    let meta = domain.metadata();
    Ok(match item {
        DataRef::Class(id) => DataItem::Class(meta.class(*id)?),
        DataRef::Method(id) => DataItem::Method(domain.interp_method(*id)?),
        DataRef::Signature(sig) => DataItem::Signature(sig.clone()),
        DataRef::String(value) => DataItem::String(domain.intern_string(value)?),
        DataRef::StaticField(id) => {
            let (class, field) = meta.field(*id)?;
            DataItem::StaticField(class.statics.addr(field.offset) as usize)
        }
        DataRef::Pointer(addr) => DataItem::Pointer(*addr),
        DataRef::Type(ty) => DataItem::Type(*ty),
    })
}
