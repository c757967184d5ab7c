pub mod error;
pub mod filter_parser;
pub mod include;
pub mod operation_outcome;
pub mod partition;
pub mod pid;
pub mod search_param;
pub mod search_param_registry;
pub mod search_parameter_map;
pub mod settings;

pub use error::{Result, SearchError};
pub use filter_parser::{Filter, FilterParameter, LogicalOp};
pub use include::{EverythingMode, Include, SortOrder, SortSpec};
pub use operation_outcome::{IssueSeverity, IssueType, OperationOutcome};
pub use partition::{
    FixedPartitionResolver, PartitionResolver, PartitionSettings, RequestPartitionId,
};
pub use pid::ResourcePid;
pub use search_param::{
    CompareOp, DateRange, ParamValue, ReferenceParam, SearchParamType, TokenParam,
};
pub use search_param_registry::{
    InMemorySearchParamRegistry, RuntimeSearchParam, SearchParamRegistry, UniqueComboParam,
};
pub use search_parameter_map::{DateRangeParam, SearchParameterMap};
pub use settings::{SearchSettings, StoreMetaSource};
