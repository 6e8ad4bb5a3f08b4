//! Query aggregation: the result table, data sources, and the execution
//! engine that ties FROM/SPLIT/WHERE/GROUP BY/STORE together (C10).

pub mod engine;
pub mod source;
pub mod table;

pub use engine::{run_query, AggregationContext, AggregatorEngine, DataSplitter, QueryResult};
pub use source::{FileSource, Source, SourceFile, TsFileSource};
pub use table::{group_by, GroupKey, Row, Table};
