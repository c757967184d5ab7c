use chrono::Utc;
use shirabe_core::{CompareOp, DateRange, Result, SearchError};

use super::IndexTable;
use crate::sql::{BinaryOp, ColumnRef, Condition, SearchQueryBuilder, TableRef};

pub const DATE_TABLE: &str = "hfj_spidx_date";

const ONE_DAY_MS: i64 = 86_400_000;

pub struct DateIndex {
    table: TableRef,
}

impl IndexTable for DateIndex {
    const TABLE_NAME: &'static str = DATE_TABLE;

    fn table(&self) -> TableRef {
        self.table
    }
}

impl DateIndex {
    pub fn new(table: TableRef) -> Self {
        Self { table }
    }

    pub fn low_column(&self) -> ColumnRef {
        self.table.column("sp_value_low")
    }

    pub fn high_column(&self) -> ColumnRef {
        self.table.column("sp_value_high")
    }

    /// Compare the indexed range `[low, high]` with the queried range.
    ///
    /// `eq` requires the indexed range to lie inside the queried one; `ap`
    /// widens the queried range by 10% of its distance from now (at least a day).
    pub fn range_predicate(
        &self,
        sql: &mut SearchQueryBuilder,
        op: CompareOp,
        range: &DateRange,
    ) -> Result<Condition> {
        let low = self.low_column();
        let high = self.high_column();
        let mut compare = |column: ColumnRef, op: BinaryOp, bound: i64| {
            let placeholder = sql.bind(bound);
            Condition::compare(column, op, placeholder)
        };
        let condition = match op {
            CompareOp::Eq => Condition::And(vec![
                compare(low, BinaryOp::Ge, range.low),
                compare(high, BinaryOp::Le, range.high),
            ]),
            CompareOp::Ne => Condition::Or(vec![
                compare(low, BinaryOp::Lt, range.low),
                compare(high, BinaryOp::Gt, range.high),
            ]),
            CompareOp::Gt => compare(high, BinaryOp::Gt, range.high),
            CompareOp::Lt => compare(low, BinaryOp::Lt, range.low),
            CompareOp::Ge => compare(high, BinaryOp::Ge, range.low),
            CompareOp::Le => compare(low, BinaryOp::Le, range.high),
            CompareOp::Sa => compare(low, BinaryOp::Gt, range.high),
            CompareOp::Eb => compare(high, BinaryOp::Lt, range.low),
            CompareOp::Ap => {
                let now = Utc::now().timestamp_millis();
                let pad = ((now - range.low).abs() / 10).max(ONE_DAY_MS);
                Condition::And(vec![
                    compare(low, BinaryOp::Le, range.high + pad),
                    compare(high, BinaryOp::Ge, range.low - pad),
                ])
            }
            other => {
                return Err(SearchError::invalid(format!(
                    "Invalid prefix \"{other}\" for date parameter"
                )));
            }
        };
        Ok(condition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shirabe_core::RequestPartitionId;

    fn render(op: CompareOp) -> String {
        let mut sql = SearchQueryBuilder::new("Patient", RequestPartitionId::AllPartitions, false);
        let index = DateIndex::new(sql.add_table(DATE_TABLE, "res_id", None));
        let range = DateRange::parse("2020").unwrap();
        index.range_predicate(&mut sql, op, &range).unwrap().to_string()
    }

    #[test]
    fn test_prefix_shapes() {
        assert_eq!(render(CompareOp::Eq), "(t0.sp_value_low >= ?1 AND t0.sp_value_high <= ?2)");
        assert_eq!(render(CompareOp::Ne), "(t0.sp_value_low < ?1 OR t0.sp_value_high > ?2)");
        assert_eq!(render(CompareOp::Gt), "t0.sp_value_high > ?1");
        assert_eq!(render(CompareOp::Lt), "t0.sp_value_low < ?1");
        assert_eq!(render(CompareOp::Ge), "t0.sp_value_high >= ?1");
        assert_eq!(render(CompareOp::Le), "t0.sp_value_low <= ?1");
        assert_eq!(render(CompareOp::Sa), "t0.sp_value_low > ?1");
        assert_eq!(render(CompareOp::Eb), "t0.sp_value_high < ?1");
    }

    #[test]
    fn test_string_operator_rejected() {
        let mut sql = SearchQueryBuilder::new("Patient", RequestPartitionId::AllPartitions, false);
        let index = DateIndex::new(sql.add_table(DATE_TABLE, "res_id", None));
        let range = DateRange::parse("2020").unwrap();
        assert!(index.range_predicate(&mut sql, CompareOp::Co, &range).is_err());
    }
}
