use shirabe_core::search_param::StringParam;
use shirabe_core::{CompareOp, Result, SearchError};

use super::{HashContext, IndexTable};
use crate::hash::{escape_like, norm_prefix, normalize_string, truncate};
use crate::sql::{BinaryOp, Condition, SearchQueryBuilder, TableRef};

pub const STRING_TABLE: &str = "hfj_spidx_string";

pub struct StringIndex {
    table: TableRef,
}

impl IndexTable for StringIndex {
    const TABLE_NAME: &'static str = STRING_TABLE;

    fn table(&self) -> TableRef {
        self.table
    }
}

impl StringIndex {
    pub fn new(table: TableRef) -> Self {
        Self { table }
    }

    /// Condition for one string value. Plain searches use [`CompareOp::Sw`]
    /// (starts-with on the normalized value); `_filter` passes its operator.
    pub fn value_predicate(
        &self,
        sql: &mut SearchQueryBuilder,
        ctx: &HashContext<'_>,
        param: &StringParam,
        op: CompareOp,
    ) -> Result<Condition> {
        let normalized_column = self.table.column("sp_value_normalized");

        if param.exact {
            let value = sql.bind(ctx.hash(&[&truncate(&param.value)]));
            return Ok(Condition::eq(self.table.column("hash_exact"), value));
        }

        let normalized = normalize_string(&param.value);
        let op = if param.contains || param.text { CompareOp::Co } else { op };
        if normalized.is_empty() && matches!(op, CompareOp::Sw | CompareOp::Co | CompareOp::Ew) {
            return Ok(self.hash_identity_predicate(sql, ctx));
        }

        let condition = match op {
            CompareOp::Sw | CompareOp::Eq => {
                let prefix = sql.bind(ctx.hash(&[&norm_prefix(&normalized)]));
                let prefix = Condition::eq(self.table.column("hash_norm_prefix"), prefix);
                let value = if op == CompareOp::Sw {
                    let pattern = sql.bind(format!("{}%", escape_like(&normalized)));
                    Condition::Like {
                        column: normalized_column,
                        pattern,
                        negate: false,
                    }
                } else {
                    let value = sql.bind(normalized);
                    Condition::eq(normalized_column, value)
                };
                Condition::And(vec![prefix, value])
            }
            CompareOp::Co | CompareOp::Ew => {
                let identity = self.hash_identity_predicate(sql, ctx);
                let pattern = if op == CompareOp::Co {
                    format!("%{}%", escape_like(&normalized))
                } else {
                    format!("%{}", escape_like(&normalized))
                };
                let pattern = sql.bind(pattern);
                Condition::And(vec![
                    identity,
                    Condition::Like {
                        column: normalized_column,
                        pattern,
                        negate: false,
                    },
                ])
            }
            CompareOp::Ne => {
                let identity = self.hash_identity_predicate(sql, ctx);
                let value = sql.bind(normalized);
                Condition::And(vec![
                    identity,
                    Condition::compare(normalized_column, BinaryOp::Ne, value),
                ])
            }
            other => {
                return Err(SearchError::invalid(format!(
                    "Unsupported operator specified in _filter clause: {other}"
                )));
            }
        };
        Ok(condition)
    }

    pub fn sort_column(&self) -> crate::sql::ColumnRef {
        self.table.column("sp_value_normalized")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shirabe_core::RequestPartitionId;

    fn setup() -> (SearchQueryBuilder, StringIndex) {
        let mut sql = SearchQueryBuilder::new("Patient", RequestPartitionId::AllPartitions, false);
        let table = sql.add_table(STRING_TABLE, "res_id", None);
        (sql, StringIndex::new(table))
    }

    const CTX: HashContext<'static> = HashContext {
        partition: None,
        resource_type: "Patient",
        param_name: "family",
    };

    #[test]
    fn test_default_is_normalized_prefix() {
        let (mut sql, index) = setup();
        let condition = index
            .value_predicate(&mut sql, &CTX, &StringParam::new("Mül"), CompareOp::Sw)
            .unwrap();
        assert_eq!(
            condition.to_string(),
            "(t0.hash_norm_prefix = ?1 AND t0.sp_value_normalized LIKE ?2 ESCAPE '\\')"
        );
        let generated = sql.generate(None);
        assert_eq!(generated.bind_variables[1].to_string(), "'MUL%'");
    }

    #[test]
    fn test_exact_uses_exact_hash() {
        let (mut sql, index) = setup();
        let param = StringParam {
            exact: true,
            ..StringParam::new("Smith")
        };
        let condition = index.value_predicate(&mut sql, &CTX, &param, CompareOp::Sw).unwrap();
        assert_eq!(condition.to_string(), "t0.hash_exact = ?1");
    }

    #[test]
    fn test_contains_uses_identity_and_wildcards() {
        let (mut sql, index) = setup();
        let param = StringParam {
            contains: true,
            ..StringParam::new("it_h")
        };
        index.value_predicate(&mut sql, &CTX, &param, CompareOp::Sw).unwrap();
        let generated = sql.generate(None);
        assert_eq!(generated.bind_variables[1].to_string(), "'%IT\\_H%'");
    }

    #[test]
    fn test_unsupported_filter_operator() {
        let (mut sql, index) = setup();
        let err = index
            .value_predicate(&mut sql, &CTX, &StringParam::new("x"), CompareOp::Gt)
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported operator"));
    }
}
