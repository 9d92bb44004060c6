use super::PlanError;
use crate::operators::PhysicalOperator;
use serde::Serialize;
use std::fmt::{self, Display};

/// Where a [`PipelineBuilder`] stands in
/// `Begin -> Source -> Operator* -> Sink -> End`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BuilderState {
    Begin,
    Source,
    Operator,
    Sink,
    End,
}

impl Display for BuilderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Begin => "BEGIN",
            Self::Source => "APPEND_SOURCE",
            Self::Operator => "APPEND_OPERATOR",
            Self::Sink => "APPEND_SINK",
            Self::End => "END",
        })
    }
}

/// Assembles the operator chain of one pipeline.
///
/// Every chain starts with exactly one source operator and ends with
/// exactly one sink operator. Anything else is rejected with
/// [`PlanError::InvalidBuilderTransition`] and leaves the builder unchanged.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    state: BuilderState,
    operators: Vec<PhysicalOperator>,
}

impl PipelineBuilder {
    pub const fn new() -> Self {
        Self {
            state: BuilderState::Begin,
            operators: Vec::new(),
        }
    }

    pub const fn state(&self) -> BuilderState {
        self.state
    }

    pub fn operators(&self) -> &[PhysicalOperator] {
        &self.operators
    }

    fn transition(&self, action: &str) -> PlanError {
        PlanError::InvalidBuilderTransition {
            state: self.state,
            action: action.to_owned(),
        }
    }

    pub fn append_source(&mut self, operator: PhysicalOperator) -> Result<&mut Self, PlanError> {
        if self.state != BuilderState::Begin || !operator.is_source() {
            return Err(self.transition(&format!("append source {operator}")));
        }
        self.operators.push(operator);
        self.state = BuilderState::Source;
        Ok(self)
    }

    pub fn append_operator(&mut self, operator: PhysicalOperator) -> Result<&mut Self, PlanError> {
        let open = matches!(self.state, BuilderState::Source | BuilderState::Operator);
        if !open || operator.is_source() || operator.is_sink() {
            return Err(self.transition(&format!("append operator {operator}")));
        }
        self.operators.push(operator);
        self.state = BuilderState::Operator;
        Ok(self)
    }

    pub fn append_sink(&mut self, operator: PhysicalOperator) -> Result<&mut Self, PlanError> {
        let open = matches!(self.state, BuilderState::Source | BuilderState::Operator);
        if !open || !operator.is_sink() {
            return Err(self.transition(&format!("append sink {operator}")));
        }
        self.operators.push(operator);
        self.state = BuilderState::Sink;
        Ok(self)
    }

    /// The finished chain.
    pub fn finish(&mut self) -> Result<Vec<PhysicalOperator>, PlanError> {
        if self.state != BuilderState::Sink {
            return Err(self.transition("finish"));
        }
        self.state = BuilderState::End;
        Ok(std::mem::take(&mut self.operators))
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::{MemoryLayout, Schema},
        operators::{Emit, Expression, Scan, Selection},
        types::Type,
    };
    use pretty_assertions::assert_eq;

    fn layout() -> MemoryLayout {
        MemoryLayout::row(Schema::new().with("a", Type::I64), 64).unwrap()
    }

    fn scan() -> PhysicalOperator {
        PhysicalOperator::Scan(Scan::new(layout()))
    }

    fn emit() -> PhysicalOperator {
        PhysicalOperator::Emit(Emit::new(layout()))
    }

    fn selection() -> PhysicalOperator {
        let schema = layout().schema().clone();
        let predicate = Expression::field("a").gt(Expression::constant(0i64));
        PhysicalOperator::Selection(Selection::new(predicate, &schema).unwrap())
    }

    #[test]
    fn source_operators_sink() {
        let mut builder = PipelineBuilder::new();
        builder
            .append_source(scan())
            .unwrap()
            .append_operator(selection())
            .unwrap()
            .append_operator(selection())
            .unwrap()
            .append_sink(emit())
            .unwrap();
        let operators = builder.finish().unwrap();
        assert_eq!(operators.len(), 4);
        assert_eq!(builder.state(), BuilderState::End);
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let mut builder = PipelineBuilder::new();
        assert!(matches!(
            builder.append_operator(selection()),
            Err(PlanError::InvalidBuilderTransition {
                state: BuilderState::Begin,
                ..
            })
        ));
        assert!(builder.append_sink(emit()).is_err());
        assert!(builder.finish().is_err());
        // A sink is not a source
        assert!(builder.append_source(emit()).is_err());
        assert_eq!(builder.state(), BuilderState::Begin);

        builder.append_source(scan()).unwrap();
        assert!(builder.append_source(scan()).is_err());
        assert!(builder.append_operator(emit()).is_err());
        builder.append_sink(emit()).unwrap();
        assert!(builder.append_operator(selection()).is_err());
        assert_eq!(builder.state(), BuilderState::Sink);
        builder.finish().unwrap();
        assert!(builder.finish().is_err());
    }
}
