use shirabe_core::search_param::{UriModifier, UriParam};
use shirabe_core::{CompareOp, Result, SearchError};

use super::{HashContext, IndexTable};
use crate::hash::escape_like;
use crate::sql::{BinaryOp, Condition, SearchQueryBuilder, TableRef};

pub const URI_TABLE: &str = "hfj_spidx_uri";

pub struct UriIndex {
    table: TableRef,
}

impl IndexTable for UriIndex {
    const TABLE_NAME: &'static str = URI_TABLE;

    fn table(&self) -> TableRef {
        self.table
    }
}

impl UriIndex {
    pub fn new(table: TableRef) -> Self {
        Self { table }
    }

    pub fn value_predicate(
        &self,
        sql: &mut SearchQueryBuilder,
        ctx: &HashContext<'_>,
        param: &UriParam,
        op: CompareOp,
    ) -> Result<Condition> {
        let uri = self.table.column("sp_uri");
        let condition = match (param.modifier, op) {
            (Some(UriModifier::Above), _) => {
                // stored URIs that are a prefix of the searched one
                let identity = self.hash_identity_predicate(sql, ctx);
                let value = sql.bind(param.value.as_str());
                Condition::And(vec![identity, Condition::PrefixOf { column: uri, value }])
            }
            (Some(UriModifier::Below), _) | (None, CompareOp::Sw) => {
                let identity = self.hash_identity_predicate(sql, ctx);
                let pattern = sql.bind(format!("{}%", escape_like(&param.value)));
                Condition::And(vec![
                    identity,
                    Condition::Like {
                        column: uri,
                        pattern,
                        negate: false,
                    },
                ])
            }
            (None, CompareOp::Eq) => {
                let value = sql.bind(ctx.hash(&[&param.value]));
                Condition::eq(self.table.column("hash_uri"), value)
            }
            (None, CompareOp::Ne) => {
                let identity = self.hash_identity_predicate(sql, ctx);
                let value = sql.bind(param.value.as_str());
                Condition::And(vec![identity, Condition::compare(uri, BinaryOp::Ne, value)])
            }
            (None, CompareOp::Co) => {
                let identity = self.hash_identity_predicate(sql, ctx);
                let pattern = sql.bind(format!("%{}%", escape_like(&param.value)));
                Condition::And(vec![
                    identity,
                    Condition::Like {
                        column: uri,
                        pattern,
                        negate: false,
                    },
                ])
            }
            (None, other) => {
                return Err(SearchError::invalid(format!(
                    "Unsupported operator specified in _filter clause: {other}"
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

    const CTX: HashContext<'static> = HashContext {
        partition: None,
        resource_type: "Device",
        param_name: "url",
    };

    fn param(value: &str, modifier: Option<UriModifier>) -> UriParam {
        UriParam {
            value: value.to_string(),
            modifier,
            missing: None,
        }
    }

    #[test]
    fn test_uri_shapes() {
        let mut sql = SearchQueryBuilder::new("Device", RequestPartitionId::AllPartitions, false);
        let index = UriIndex::new(sql.add_table(URI_TABLE, "res_id", None));
        let eq = index
            .value_predicate(&mut sql, &CTX, &param("http://a/b", None), CompareOp::Eq)
            .unwrap();
        assert_eq!(eq.to_string(), "t0.hash_uri = ?1");

        let above = index
            .value_predicate(&mut sql, &CTX, &param("http://a/b/c", Some(UriModifier::Above)), CompareOp::Eq)
            .unwrap();
        assert_eq!(
            above.to_string(),
            "(t0.hash_identity = ?2 AND substr(?3, 1, length(t0.sp_uri)) = t0.sp_uri)"
        );

        let below = index
            .value_predicate(&mut sql, &CTX, &param("http://a", Some(UriModifier::Below)), CompareOp::Eq)
            .unwrap();
        assert!(below.to_string().contains("LIKE"));
    }
}
