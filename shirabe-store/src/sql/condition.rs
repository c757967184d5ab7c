use std::fmt;

use super::{ColumnRef, Placeholder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl BinaryOp {
    fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }
}

/// Immutable boolean expression over index table columns.
///
/// Optional conditions are combined with [`Condition::and`] /
/// [`Condition::or`], which drop `None` members, so "no constraint" never
/// ends up inside an AND/OR.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Compare {
        column: ColumnRef,
        op: BinaryOp,
        value: Placeholder,
    },
    ColumnsEqual(ColumnRef, ColumnRef),
    IsNull {
        column: ColumnRef,
        negate: bool,
    },
    In {
        column: ColumnRef,
        values: Vec<Placeholder>,
        negate: bool,
    },
    InSubquery {
        column: ColumnRef,
        sql: String,
        negate: bool,
    },
    Like {
        column: ColumnRef,
        pattern: Placeholder,
        negate: bool,
    },
    /// The bound value starts with the column value
    PrefixOf {
        column: ColumnRef,
        value: Placeholder,
    },
    /// Matches no row
    Never,
}

impl Condition {
    pub fn and(conditions: impl IntoIterator<Item = Option<Condition>>) -> Option<Condition> {
        let mut items: Vec<Condition> = conditions.into_iter().flatten().collect();
        match items.len() {
            0 => None,
            1 => items.pop(),
            _ => Some(Condition::And(items)),
        }
    }

    pub fn or(conditions: impl IntoIterator<Item = Option<Condition>>) -> Option<Condition> {
        let mut items: Vec<Condition> = conditions.into_iter().flatten().collect();
        match items.len() {
            0 => None,
            1 => items.pop(),
            _ => Some(Condition::Or(items)),
        }
    }

    pub fn not(inner: Condition) -> Condition {
        Condition::Not(Box::new(inner))
    }

    pub fn compare(column: ColumnRef, op: BinaryOp, value: Placeholder) -> Condition {
        Condition::Compare { column, op, value }
    }

    pub fn eq(column: ColumnRef, value: Placeholder) -> Condition {
        Self::compare(column, BinaryOp::Eq, value)
    }

    /// `col = ?` for one value, `col IN (...)` for several; `<>` / `NOT IN` when inverse
    pub fn equal_to_or_in(column: ColumnRef, mut values: Vec<Placeholder>, inverse: bool) -> Condition {
        if values.len() == 1 {
            let op = if inverse { BinaryOp::Ne } else { BinaryOp::Eq };
            return Self::compare(column, op, values.remove(0));
        }
        Condition::In {
            column,
            values,
            negate: inverse,
        }
    }

    pub fn in_subquery(column: ColumnRef, sql: String, negate: bool) -> Condition {
        Condition::InSubquery {
            column,
            sql,
            negate,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::And(items) | Condition::Or(items) => {
                let joiner = if matches!(self, Condition::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                f.write_str("(")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(joiner)?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
            Condition::Not(inner) => write!(f, "NOT ({inner})"),
            Condition::Compare { column, op, value } => write!(f, "{column} {} {value}", op.sql()),
            Condition::ColumnsEqual(left, right) => write!(f, "{left} = {right}"),
            Condition::IsNull { column, negate } => {
                let not = if *negate { " NOT" } else { "" };
                write!(f, "{column} IS{not} NULL")
            }
            Condition::In {
                column,
                values,
                negate,
            } => {
                if values.is_empty() {
                    return f.write_str(if *negate { "1 = 1" } else { "1 = 0" });
                }
                let not = if *negate { "NOT " } else { "" };
                write!(f, "{column} {not}IN (")?;
                for (idx, value) in values.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str(")")
            }
            Condition::InSubquery {
                column,
                sql,
                negate,
            } => {
                let not = if *negate { "NOT " } else { "" };
                write!(f, "{column} {not}IN ({sql})")
            }
            Condition::Like {
                column,
                pattern,
                negate,
            } => {
                let not = if *negate { "NOT " } else { "" };
                write!(f, "{column} {not}LIKE {pattern} ESCAPE '\\'")
            }
            Condition::PrefixOf { column, value } => {
                write!(f, "substr({value}, 1, length({column})) = {column}")
            }
            Condition::Never => f.write_str("1 = 0"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::TableRef;

    fn column(name: &'static str) -> ColumnRef {
        TableRef::new(0, "hfj_spidx_token").column(name)
    }

    #[test]
    fn test_and_or_collapse() {
        assert_eq!(Condition::and(vec![None, None]), None);
        let single = Condition::eq(column("hash_value"), Placeholder(1));
        assert_eq!(
            Condition::or(vec![None, Some(single.clone())]),
            Some(single.clone())
        );
        let both = Condition::and(vec![Some(single.clone()), Some(Condition::Never)]).unwrap();
        assert_eq!(both.to_string(), "(t0.hash_value = ?1 AND 1 = 0)");
    }

    #[test]
    fn test_equal_to_or_in() {
        let one = Condition::equal_to_or_in(column("hash_value"), vec![Placeholder(1)], false);
        assert_eq!(one.to_string(), "t0.hash_value = ?1");
        let one_inverse = Condition::equal_to_or_in(column("hash_value"), vec![Placeholder(1)], true);
        assert_eq!(one_inverse.to_string(), "t0.hash_value <> ?1");
        let many = Condition::equal_to_or_in(
            column("hash_value"),
            vec![Placeholder(1), Placeholder(2)],
            true,
        );
        assert_eq!(many.to_string(), "t0.hash_value NOT IN (?1,?2)");
    }

    #[test]
    fn test_render_misc() {
        let like = Condition::Like {
            column: column("sp_value"),
            pattern: Placeholder(3),
            negate: false,
        };
        assert_eq!(like.to_string(), "t0.sp_value LIKE ?3 ESCAPE '\\'");
        let sub = Condition::in_subquery(column("res_id"), "SELECT 1".to_string(), true);
        assert_eq!(sub.to_string(), "t0.res_id NOT IN (SELECT 1)");
        let empty = Condition::In {
            column: column("res_id"),
            values: vec![],
            negate: false,
        };
        assert_eq!(empty.to_string(), "1 = 0");
    }
}
