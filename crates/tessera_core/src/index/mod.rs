//! Map/reduce indexes.
//!
//! - [`definition`]: declarative definitions compiled into map and reduce
//!   functions
//! - [`fulltext`]: the inverted index holding the entries
//! - [`storage`]: registered indexes, definition files and snapshots
//! - [`extension`]: per-index hooks and the suggestion dictionary

pub mod definition;
pub mod extension;
pub mod fulltext;
pub mod storage;

pub use definition::{
    reduce_key, AggregateDefinition, AggregateOp, CompiledIndex, FieldConversion, FieldIndexing,
    FieldMapping, FieldPath, FieldStorage, IndexDefinition, MapDefinition, MappedFields,
    ReduceDefinition, DOCUMENT_ID_FIELD, REDUCE_KEY_FIELD,
};
pub use extension::{
    IndexExtension, SuggestionIndexExtension, SuggestionQuery, SuggestionQueryResult,
};
pub use fulltext::{FullTextIndex, IndexEntry, RangeValue, TokenizerConfig, NULL_VALUE};
pub use storage::{AppliedEtags, Index, IndexCreationOptions, IndexStorage};
