//! Number and quantity indexes, and the numeric comparison shared by both.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use shirabe_core::search_param::QuantityParam;
use shirabe_core::{CompareOp, Result, SearchError};

use super::{HashContext, IndexTable};
use crate::sql::{BinaryOp, ColumnRef, Condition, SearchQueryBuilder, TableRef};

pub const NUMBER_TABLE: &str = "hfj_spidx_number";
pub const QUANTITY_TABLE: &str = "hfj_spidx_quantity";

/// Half-width of the band `eq` accepts: half a unit of the last written digit
/// (`1` -> 0.5, `1.00` -> 0.005)
pub fn eq_tolerance(value: Decimal) -> Decimal {
    let scale = (value.scale() + 1).min(28);
    Decimal::new(5, scale)
}

/// Half-width of the band `ap` accepts: 10% of the value
pub fn ap_tolerance(value: Decimal) -> Decimal {
    (value * Decimal::new(1, 1)).abs()
}

fn to_f64(value: Decimal) -> Result<f64> {
    value
        .to_f64()
        .ok_or_else(|| SearchError::internal(format!("Decimal {value} is not representable")))
}

/// Compare `column` with `value` under `op`; `eq`/`ne`/`ap` are tolerance banded
pub fn numeric_predicate(
    sql: &mut SearchQueryBuilder,
    column: ColumnRef,
    op: CompareOp,
    value: Decimal,
    param_name: &str,
) -> Result<Condition> {
    let mut compare = |op: BinaryOp, bound: Decimal| -> Result<Condition> {
        let placeholder = sql.bind(to_f64(bound)?);
        Ok(Condition::compare(column, op, placeholder))
    };
    let condition = match op {
        CompareOp::Eq => {
            let tolerance = eq_tolerance(value);
            Condition::And(vec![
                compare(BinaryOp::Ge, value - tolerance)?,
                compare(BinaryOp::Lt, value + tolerance)?,
            ])
        }
        CompareOp::Ne => {
            let tolerance = eq_tolerance(value);
            Condition::Or(vec![
                compare(BinaryOp::Lt, value - tolerance)?,
                compare(BinaryOp::Ge, value + tolerance)?,
            ])
        }
        CompareOp::Ap => {
            let tolerance = ap_tolerance(value);
            Condition::And(vec![
                compare(BinaryOp::Ge, value - tolerance)?,
                compare(BinaryOp::Le, value + tolerance)?,
            ])
        }
        CompareOp::Gt => compare(BinaryOp::Gt, value)?,
        CompareOp::Ge => compare(BinaryOp::Ge, value)?,
        CompareOp::Lt => compare(BinaryOp::Lt, value)?,
        CompareOp::Le => compare(BinaryOp::Le, value)?,
        other => {
            return Err(SearchError::invalid(format!(
                "Invalid prefix \"{other}\" for numeric parameter \"{param_name}\""
            )));
        }
    };
    Ok(condition)
}

pub struct NumberIndex {
    table: TableRef,
}

impl IndexTable for NumberIndex {
    const TABLE_NAME: &'static str = NUMBER_TABLE;

    fn table(&self) -> TableRef {
        self.table
    }
}

impl NumberIndex {
    pub fn new(table: TableRef) -> Self {
        Self { table }
    }

    pub fn value_column(&self) -> ColumnRef {
        self.table.column("sp_value")
    }
}

pub struct QuantityIndex {
    table: TableRef,
}

impl IndexTable for QuantityIndex {
    const TABLE_NAME: &'static str = QUANTITY_TABLE;

    fn table(&self) -> TableRef {
        self.table
    }
}

impl QuantityIndex {
    pub fn new(table: TableRef) -> Self {
        Self { table }
    }

    pub fn value_column(&self) -> ColumnRef {
        self.table.column("sp_value")
    }

    /// Identity hash narrowed by whatever of system/units the value carries,
    /// followed by the numeric comparison
    pub fn value_predicate(
        &self,
        sql: &mut SearchQueryBuilder,
        ctx: &HashContext<'_>,
        param: &QuantityParam,
        op: CompareOp,
    ) -> Result<Condition> {
        let hash = match (param.system.as_deref(), param.units.as_deref()) {
            (Some(system), Some(units)) => {
                let value = sql.bind(ctx.hash(&[system, units]));
                Condition::eq(self.table.column("hash_identity_sys_units"), value)
            }
            (None, Some(units)) => {
                let value = sql.bind(ctx.hash(&[units]));
                Condition::eq(self.table.column("hash_identity_and_units"), value)
            }
            _ => self.hash_identity_predicate(sql, ctx),
        };
        let value = param.value.ok_or_else(|| {
            SearchError::invalid(format!(
                "Missing value for quantity parameter \"{}\"",
                ctx.param_name
            ))
        })?;
        let numeric = numeric_predicate(sql, self.value_column(), op, value, ctx.param_name)?;
        Ok(Condition::And(vec![hash, numeric]))
    }
}
