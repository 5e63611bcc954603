//! Boolean conditions over the series values of one group.
//!
//! Conditions are trees tagged by `expr`:
//!
//! ```yaml
//! expr: "&&"
//! left: { expr: ">", left: { expr: number-ref, ref: count }, right: { expr: number, value: 10 } }
//! right: { expr: "<", left: { expr: number-ref, ref: avg }, right: { expr: number, value: 2.5 } }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("'{0}' does not produce a number")]
    NotNumeric(&'static str),

    #[error("'{0}' does not produce a boolean")]
    NotBoolean(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "expr")]
pub enum Expr {
    #[serde(rename = "true")]
    True,

    #[serde(rename = "number")]
    Number { value: f64 },

    /// Value of the series with this id
    #[serde(rename = "number-ref")]
    NumberRef {
        #[serde(rename = "ref")]
        reference: String,
    },

    #[serde(rename = "<")]
    Lesser { left: Box<Expr>, right: Box<Expr> },

    #[serde(rename = "<=")]
    LesserEqual { left: Box<Expr>, right: Box<Expr> },

    #[serde(rename = ">")]
    Greater { left: Box<Expr>, right: Box<Expr> },

    #[serde(rename = ">=")]
    GreaterEqual { left: Box<Expr>, right: Box<Expr> },

    #[serde(rename = "==")]
    Equal { left: Box<Expr>, right: Box<Expr> },

    #[serde(rename = "!=")]
    NotEqual { left: Box<Expr>, right: Box<Expr> },

    #[serde(rename = "&&")]
    And { left: Box<Expr>, right: Box<Expr> },

    #[serde(rename = "||")]
    Or { left: Box<Expr>, right: Box<Expr> },

    #[serde(rename = "!")]
    Not { left: Box<Expr> },
}

impl Expr {
    pub fn number(value: f64) -> Self {
        Self::Number { value }
    }

    pub fn reference(id: impl Into<String>) -> Self {
        Self::NumberRef {
            reference: id.into(),
        }
    }

    pub fn greater(left: Expr, right: Expr) -> Self {
        Self::Greater {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn lesser(left: Expr, right: Expr) -> Self {
        Self::Lesser {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(left: Expr, right: Expr) -> Self {
        Self::And {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn or(left: Expr, right: Expr) -> Self {
        Self::Or {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn not(inner: Expr) -> Self {
        Self::Not {
            left: Box::new(inner),
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            Self::True => "true",
            Self::Number { .. } => "number",
            Self::NumberRef { .. } => "number-ref",
            Self::Lesser { .. } => "<",
            Self::LesserEqual { .. } => "<=",
            Self::Greater { .. } => ">",
            Self::GreaterEqual { .. } => ">=",
            Self::Equal { .. } => "==",
            Self::NotEqual { .. } => "!=",
            Self::And { .. } => "&&",
            Self::Or { .. } => "||",
            Self::Not { .. } => "!",
        }
    }

    /// Series ids referenced anywhere in the tree.
    pub fn references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::True | Self::Number { .. } => {}
            Self::NumberRef { reference } => out.push(reference),
            Self::Not { left } => left.collect_references(out),
            Self::Lesser { left, right }
            | Self::LesserEqual { left, right }
            | Self::Greater { left, right }
            | Self::GreaterEqual { left, right }
            | Self::Equal { left, right }
            | Self::NotEqual { left, right }
            | Self::And { left, right }
            | Self::Or { left, right } => {
                left.collect_references(out);
                right.collect_references(out);
            }
        }
    }

    /// Evaluates a boolean expression against series values keyed by id.
    ///
    /// A comparison involving a series without a value is false.
    pub fn evaluate(&self, values: &HashMap<String, f64>) -> Result<bool, ConditionError> {
        let compare = |left: &Expr,
                       right: &Expr,
                       op: fn(f64, f64) -> bool|
         -> Result<bool, ConditionError> {
            let left = left.number_value(values)?;
            let right = right.number_value(values)?;
            Ok(matches!((left, right), (Some(l), Some(r)) if op(l, r)))
        };

        match self {
            Self::True => Ok(true),
            Self::Lesser { left, right } => compare(left, right, |l, r| l < r),
            Self::LesserEqual { left, right } => compare(left, right, |l, r| l <= r),
            Self::Greater { left, right } => compare(left, right, |l, r| l > r),
            Self::GreaterEqual { left, right } => compare(left, right, |l, r| l >= r),
            Self::Equal { left, right } => compare(left, right, |l, r| l == r),
            Self::NotEqual { left, right } => compare(left, right, |l, r| l != r),
            Self::And { left, right } => Ok(left.evaluate(values)? && right.evaluate(values)?),
            Self::Or { left, right } => Ok(left.evaluate(values)? || right.evaluate(values)?),
            Self::Not { left } => Ok(!left.evaluate(values)?),
            Self::Number { .. } | Self::NumberRef { .. } => {
                Err(ConditionError::NotBoolean(self.tag()))
            }
        }
    }

    fn number_value(&self, values: &HashMap<String, f64>) -> Result<Option<f64>, ConditionError> {
        match self {
            Self::Number { value } => Ok(Some(*value)),
            Self::NumberRef { reference } => Ok(values.get(reference).copied()),
            other => Err(ConditionError::NotNumeric(other.tag())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn deserializes_from_json() {
        let expr: Expr = serde_json::from_str(
            r#"{"expr":"&&",
                "left":{"expr":">","left":{"expr":"number-ref","ref":"count"},"right":{"expr":"number","value":10}},
                "right":{"expr":"!","left":{"expr":"==","left":{"expr":"number-ref","ref":"avg"},"right":{"expr":"number","value":0}}}}"#,
        )
        .unwrap();

        assert_eq!(
            expr,
            Expr::and(
                Expr::greater(Expr::reference("count"), Expr::number(10.0)),
                Expr::not(Expr::Equal {
                    left: Box::new(Expr::reference("avg")),
                    right: Box::new(Expr::number(0.0)),
                }),
            )
        );
        assert_eq!(expr.references(), ["count", "avg"]);
        assert!(expr.evaluate(&values(&[("count", 11.0), ("avg", 1.5)])).unwrap());
        assert!(!expr.evaluate(&values(&[("count", 11.0), ("avg", 0.0)])).unwrap());
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert!(serde_json::from_str::<Expr>(r#"{"expr":"~="}"#).is_err());
    }

    #[test]
    fn comparisons_with_missing_values_are_false() {
        let expr = Expr::lesser(Expr::reference("max"), Expr::number(5.0));
        assert!(!expr.evaluate(&HashMap::new()).unwrap());
        assert!(Expr::not(expr).evaluate(&HashMap::new()).unwrap());
    }

    #[test]
    fn or_and_true() {
        let expr = Expr::or(
            Expr::greater(Expr::reference("a"), Expr::number(100.0)),
            Expr::True,
        );
        assert!(expr.evaluate(&values(&[("a", 1.0)])).unwrap());
    }

    #[test]
    fn type_errors_are_reported() {
        assert_eq!(
            Expr::number(1.0).evaluate(&HashMap::new()),
            Err(ConditionError::NotBoolean("number"))
        );
        let expr = Expr::greater(Expr::True, Expr::number(1.0));
        assert_eq!(
            expr.evaluate(&HashMap::new()),
            Err(ConditionError::NotNumeric("true"))
        );
    }
}
