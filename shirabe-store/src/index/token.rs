use shirabe_core::search_param::TokenParam;

use super::{HashContext, IndexTable};
use crate::sql::{ColumnRef, Condition, Placeholder, SearchQueryBuilder, TableRef};

pub const TOKEN_TABLE: &str = "hfj_spidx_token";

pub struct TokenIndex {
    table: TableRef,
}

impl IndexTable for TokenIndex {
    const TABLE_NAME: &'static str = TOKEN_TABLE;

    fn table(&self) -> TableRef {
        self.table
    }
}

/// Which hash column a token value is matched on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenHash {
    Value,
    System,
    SystemAndValue,
}

impl TokenHash {
    fn column(self) -> &'static str {
        match self {
            Self::Value => "hash_value",
            Self::System => "hash_sys",
            Self::SystemAndValue => "hash_sys_and_value",
        }
    }
}

impl TokenIndex {
    pub fn new(table: TableRef) -> Self {
        Self { table }
    }

    /// Hash column and hash for one token value; `None` when neither system nor code is given
    pub fn token_hash(ctx: &HashContext<'_>, token: &TokenParam) -> Option<(&'static str, i64)> {
        let (kind, hash) = match (token.system.as_deref(), token.value.as_deref()) {
            (Some(system), Some(value)) => (TokenHash::SystemAndValue, ctx.hash(&[system, value])),
            (None, Some(value)) => (TokenHash::Value, ctx.hash(&[value])),
            (Some(system), None) if !system.is_empty() => (TokenHash::System, ctx.hash(&[system])),
            _ => return None,
        };
        Some((kind.column(), hash))
    }

    /// OR over all values, one `=`/`IN` per hash column in use
    pub fn values_predicate(
        &self,
        sql: &mut SearchQueryBuilder,
        ctx: &HashContext<'_>,
        tokens: &[&TokenParam],
    ) -> Option<Condition> {
        let mut by_column: Vec<(&'static str, Vec<Placeholder>)> = Vec::new();
        for token in tokens {
            let Some((column, hash)) = Self::token_hash(ctx, token) else {
                continue;
            };
            let placeholder = sql.bind(hash);
            match by_column.iter_mut().find(|(c, _)| *c == column) {
                Some((_, placeholders)) => placeholders.push(placeholder),
                None => by_column.push((column, vec![placeholder])),
            }
        }
        Condition::or(by_column.into_iter().map(|(column, placeholders)| {
            Some(Condition::equal_to_or_in(self.table.column(column), placeholders, false))
        }))
    }

    pub fn sort_columns(&self) -> [ColumnRef; 2] {
        [self.table.column("sp_system"), self.table.column("sp_value")]
    }
}
