pub mod error;
pub mod executor;
pub mod fulltext;
pub mod hash;
pub mod index;
pub mod interceptor;
pub mod query_iterator;
pub mod query_stack;
pub mod resolver;
pub mod schema;
pub mod search_builder;
pub mod sql;

pub use error::{Result, StoreError};
pub use executor::{EmptyCursor, RawRowExecutor, RowCursor, SqliteRowExecutor};
pub use fulltext::FulltextSearchProvider;
pub use interceptor::{LoggingInterceptor, RecordingInterceptor, SearchEvent, SearchInterceptor, SearchRuntimeDetails};
pub use query_iterator::{IteratorState, QueryIterator};
pub use query_stack::QueryStack;
pub use resolver::{IdentifierResolver, SqliteIdentifierResolver, TypedId};
pub use schema::{IndexWriter, IndexedResource, LinkTarget, TagType};
pub use search_builder::{SearchBuilder, SearchContext};
pub use sql::{GeneratedSql, SearchQueryBuilder};
