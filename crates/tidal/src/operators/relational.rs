use super::{Expression, Flow, TracedRecord};
use crate::{
    memory::Schema,
    pipeline::PlanError,
    trace::{TraceContext, TraceResult},
    types::Type,
};
use serde::Serialize;

/// Drops records for which the predicate does not hold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub predicate: Expression,
}

impl Selection {
    pub fn new(predicate: Expression, input: &Schema) -> Result<Self, PlanError> {
        let ty = predicate.result_type(input)?;
        if ty != Type::Bool {
            return Err(PlanError::TypeMismatch {
                message: format!("predicate {predicate} is {ty}, not bool"),
            });
        }
        Ok(Self { predicate })
    }

    pub(super) fn execute(&self, t: &mut TraceContext<'_>, record: &mut TracedRecord) -> TraceResult<Flow> {
        let mut frames = 0;
        let keep = self.predicate.trace(t, record, &mut frames)?;
        Ok(if t.branch(keep)? {
            Flow::Continue
        } else {
            Flow::Discard
        })
    }
}

/// Computes a field, replacing it if it exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Map {
    pub field: String,
    pub expression: Expression,
    pub ty: Type,
}

impl Map {
    pub fn new(field: impl Into<String>, expression: Expression, input: &Schema) -> Result<Self, PlanError> {
        let ty = expression.result_type(input)?;
        Ok(Self {
            field: field.into(),
            expression,
            ty,
        })
    }

    pub fn output_schema(&self, input: &Schema) -> Schema {
        let mut replaced = false;
        let mut schema: Schema = input
            .fields()
            .iter()
            .map(|field| {
                let mut field = field.clone();
                if field.name == self.field {
                    field.ty = self.ty;
                    replaced = true;
                }
                field
            })
            .collect();
        if !replaced {
            schema.push(self.field.clone(), self.ty);
        }
        schema
    }

    pub(super) fn execute(&self, t: &mut TraceContext<'_>, record: &mut TracedRecord) -> TraceResult<Flow> {
        let mut frames = 0;
        let value = self.expression.trace(t, record, &mut frames)?;
        record.set(self.field.clone(), value);
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn map_schema() {
        let input = Schema::new().with("a", Type::I32).with("b", Type::I64);
        let widen = Map::new("a", Expression::field("a").cast(Type::I64), &input).unwrap();
        assert_eq!(
            widen.output_schema(&input),
            Schema::new().with("a", Type::I64).with("b", Type::I64)
        );

        let sum = Map::new(
            "c",
            Expression::field("b").add(Expression::constant(1i64)),
            &input,
        )
        .unwrap();
        assert_eq!(
            sum.output_schema(&input),
            Schema::new()
                .with("a", Type::I32)
                .with("b", Type::I64)
                .with("c", Type::I64)
        );
    }

    #[test]
    fn predicates_must_be_boolean() {
        let input = Schema::new().with("a", Type::I32);
        assert!(Selection::new(Expression::field("a"), &input).is_err());
        assert!(Selection::new(Expression::field("a").gt(Expression::constant(0i32)), &input).is_ok());
    }
}
