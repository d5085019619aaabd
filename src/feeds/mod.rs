//! Price ingestion: source drivers, the aggregator, and the reference-price
//! resolver.

pub mod aggregator;
pub mod aux_oracle;
pub mod chainlink;
pub mod exchange_ws;
pub mod reference;

pub use aggregator::{FeedAggregator, FeedHealthHandle, SourceHealth, SourceKind, SourceUpdate};
pub use aux_oracle::{AuxOracleConfig, AuxOracleFeed};
pub use chainlink::{ChainlinkConfig, ChainlinkFeed};
pub use reference::{
    FreshnessConfig, OracleDivergence, ReferencePriceResolver, ResolvedPrice, ResolvedSource,
};
