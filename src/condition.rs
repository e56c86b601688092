// Copyright (c) 2025 - Cowboy AI, Inc.
//! Compositional condition DSL
//!
//! A [`Condition`] is a predicate over a single value: either a one-operand
//! comparison (eq/lt/gt/lte/gte/ne) or a multi-operand composition
//! (and/or/not). Conditions gate stream appends (write conditions over the
//! current stream version) and form the leaves of attribute filters.
//!
//! Every condition carries a human-readable description such as
//! `"to be equal to 10"`. The description is computed from the tree and used
//! verbatim in write-condition error messages, so its wording is part of the
//! public contract.
//!
//! # Example
//!
//! ```rust
//! use occurrent::condition::Condition;
//!
//! let cond = Condition::and(Condition::gte(3), Condition::lt(10));
//! assert!(cond.evaluate(&5));
//! assert_eq!(
//!     cond.description(),
//!     "to be greater than or equal to 3 and to be less than 10"
//! );
//! ```

use std::fmt;

use crate::errors::{OccurrentError, OccurrentResult};

/// One-operand comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    /// Equal
    Eq,
    /// Less than
    Lt,
    /// Greater than
    Gt,
    /// Less than or equal
    Lte,
    /// Greater than or equal
    Gte,
    /// Not equal
    Ne,
}

impl ComparisonOperator {
    /// Whether this operator requires an ordered operand type
    pub fn requires_ordering(&self) -> bool {
        matches!(
            self,
            ComparisonOperator::Lt
                | ComparisonOperator::Gt
                | ComparisonOperator::Lte
                | ComparisonOperator::Gte
        )
    }

    fn describe(&self) -> &'static str {
        match self {
            ComparisonOperator::Eq => "to be equal to",
            ComparisonOperator::Lt => "to be less than",
            ComparisonOperator::Gt => "to be greater than",
            ComparisonOperator::Lte => "to be less than or equal to",
            ComparisonOperator::Gte => "to be greater than or equal to",
            ComparisonOperator::Ne => "to not be equal to",
        }
    }
}

/// Multi-operand composition operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionOperator {
    /// All operands must hold
    And,
    /// At least one operand must hold
    Or,
    /// The single operand must not hold
    Not,
}

/// A predicate over a single value
///
/// The sum type has two variants: a single-operand comparison and a
/// multi-operand composition. `Not` always has exactly one operand; `And`
/// and `Or` have at least two (enforced by the constructors).
#[derive(Debug, Clone, PartialEq)]
pub enum Condition<T> {
    /// Comparison against one operand
    Single {
        /// The comparison operator
        operator: ComparisonOperator,
        /// The operand compared against
        operand: T,
    },
    /// Composition of child conditions
    Multi {
        /// The composition operator
        operator: CompositionOperator,
        /// Child conditions (one for `Not`, two or more for `And`/`Or`)
        operands: Vec<Condition<T>>,
    },
}

impl<T> Condition<T> {
    /// `value == operand`
    pub fn eq(operand: T) -> Self {
        Condition::Single {
            operator: ComparisonOperator::Eq,
            operand,
        }
    }

    /// `value < operand`
    pub fn lt(operand: T) -> Self {
        Condition::Single {
            operator: ComparisonOperator::Lt,
            operand,
        }
    }

    /// `value > operand`
    pub fn gt(operand: T) -> Self {
        Condition::Single {
            operator: ComparisonOperator::Gt,
            operand,
        }
    }

    /// `value <= operand`
    pub fn lte(operand: T) -> Self {
        Condition::Single {
            operator: ComparisonOperator::Lte,
            operand,
        }
    }

    /// `value >= operand`
    pub fn gte(operand: T) -> Self {
        Condition::Single {
            operator: ComparisonOperator::Gte,
            operand,
        }
    }

    /// `value != operand`
    pub fn ne(operand: T) -> Self {
        Condition::Single {
            operator: ComparisonOperator::Ne,
            operand,
        }
    }

    /// Both conditions must hold
    pub fn and(left: Condition<T>, right: Condition<T>) -> Self {
        Condition::Multi {
            operator: CompositionOperator::And,
            operands: vec![left, right],
        }
    }

    /// At least one condition must hold
    pub fn or(left: Condition<T>, right: Condition<T>) -> Self {
        Condition::Multi {
            operator: CompositionOperator::Or,
            operands: vec![left, right],
        }
    }

    /// The condition must not hold
    pub fn not(condition: Condition<T>) -> Self {
        Condition::Multi {
            operator: CompositionOperator::Not,
            operands: vec![condition],
        }
    }

    /// All conditions must hold; requires at least two operands
    pub fn all_of(operands: Vec<Condition<T>>) -> OccurrentResult<Self> {
        if operands.len() < 2 {
            return Err(OccurrentError::InvalidArgument(
                "'and' requires at least two conditions".to_string(),
            ));
        }
        Ok(Condition::Multi {
            operator: CompositionOperator::And,
            operands,
        })
    }

    /// At least one condition must hold; requires at least two operands
    pub fn any_of(operands: Vec<Condition<T>>) -> OccurrentResult<Self> {
        if operands.len() < 2 {
            return Err(OccurrentError::InvalidArgument(
                "'or' requires at least two conditions".to_string(),
            ));
        }
        Ok(Condition::Multi {
            operator: CompositionOperator::Or,
            operands,
        })
    }

    /// Convert the operand type, preserving the tree shape
    pub fn map<U, F>(self, f: &F) -> Condition<U>
    where
        F: Fn(T) -> U,
    {
        match self {
            Condition::Single { operator, operand } => Condition::Single {
                operator,
                operand: f(operand),
            },
            Condition::Multi { operator, operands } => Condition::Multi {
                operator,
                operands: operands.into_iter().map(|c| c.map(f)).collect(),
            },
        }
    }

    /// Visit every comparison operator in the tree
    pub fn comparisons(&self) -> Vec<(&ComparisonOperator, &T)> {
        match self {
            Condition::Single { operator, operand } => vec![(operator, operand)],
            Condition::Multi { operands, .. } => {
                operands.iter().flat_map(|c| c.comparisons()).collect()
            }
        }
    }
}

impl<T: fmt::Display> Condition<T> {
    /// The human-readable description of this condition
    ///
    /// Used verbatim in write-condition error messages.
    pub fn description(&self) -> String {
        match self {
            Condition::Single { operator, operand } => {
                format!("{} {}", operator.describe(), operand)
            }
            Condition::Multi { operator, operands } => match operator {
                CompositionOperator::And => operands
                    .iter()
                    .map(Condition::description)
                    .collect::<Vec<_>>()
                    .join(" and "),
                CompositionOperator::Or => operands
                    .iter()
                    .map(Condition::description)
                    .collect::<Vec<_>>()
                    .join(" or "),
                CompositionOperator::Not => {
                    format!("not {}", operands[0].description())
                }
            },
        }
    }
}

impl<T: PartialOrd + PartialEq> Condition<T> {
    /// Evaluate this condition against a value
    pub fn evaluate(&self, value: &T) -> bool {
        match self {
            Condition::Single { operator, operand } => match operator {
                ComparisonOperator::Eq => value == operand,
                ComparisonOperator::Ne => value != operand,
                ComparisonOperator::Lt => value < operand,
                ComparisonOperator::Gt => value > operand,
                ComparisonOperator::Lte => value <= operand,
                ComparisonOperator::Gte => value >= operand,
            },
            Condition::Multi { operator, operands } => match operator {
                CompositionOperator::And => operands.iter().all(|c| c.evaluate(value)),
                CompositionOperator::Or => operands.iter().any(|c| c.evaluate(value)),
                CompositionOperator::Not => !operands[0].evaluate(value),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(Condition::eq(10), "to be equal to 10")]
    #[test_case(Condition::lt(10), "to be less than 10")]
    #[test_case(Condition::gt(10), "to be greater than 10")]
    #[test_case(Condition::lte(10), "to be less than or equal to 10")]
    #[test_case(Condition::gte(10), "to be greater than or equal to 10")]
    #[test_case(Condition::ne(10), "to not be equal to 10")]
    fn test_single_operand_descriptions(condition: Condition<u64>, expected: &str) {
        assert_eq!(condition.description(), expected);
    }

    #[test]
    fn test_composite_descriptions() {
        let c = Condition::and(Condition::gte(3), Condition::lt(10));
        assert_eq!(
            c.description(),
            "to be greater than or equal to 3 and to be less than 10"
        );

        let c = Condition::or(Condition::eq(1), Condition::eq(2));
        assert_eq!(c.description(), "to be equal to 1 or to be equal to 2");

        let c: Condition<u64> = Condition::not(Condition::eq(7));
        assert_eq!(c.description(), "not to be equal to 7");
    }

    #[test]
    fn test_evaluation() {
        assert!(Condition::eq(5).evaluate(&5));
        assert!(!Condition::eq(5).evaluate(&6));
        assert!(Condition::not(Condition::eq(5)).evaluate(&6));
        assert!(Condition::and(Condition::gt(1), Condition::lt(10)).evaluate(&5));
        assert!(!Condition::and(Condition::gt(1), Condition::lt(10)).evaluate(&10));
        assert!(Condition::or(Condition::eq(1), Condition::eq(2)).evaluate(&2));
    }

    #[test]
    fn test_all_of_rejects_single_operand() {
        let result: OccurrentResult<Condition<u64>> = Condition::all_of(vec![Condition::eq(1)]);
        assert!(matches!(result, Err(OccurrentError::InvalidArgument(_))));

        let result: OccurrentResult<Condition<u64>> = Condition::any_of(vec![Condition::eq(1)]);
        assert!(matches!(result, Err(OccurrentError::InvalidArgument(_))));
    }

    #[test]
    fn test_map_preserves_shape_and_description() {
        let c: Condition<u64> = Condition::and(Condition::gte(3), Condition::lt(10));
        let mapped: Condition<i64> = c.map(&|v| v as i64);
        assert_eq!(
            mapped.description(),
            "to be greater than or equal to 3 and to be less than 10"
        );
    }
}
