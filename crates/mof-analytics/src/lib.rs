//! Procurement forensics and the cached read façade over the MOF store.

pub mod cache;
pub mod facade;
pub mod forensics;

pub use cache::{CacheStats, Clock, ManualClock, SystemClock, TtlCache};
pub use facade::{QueryService, RequestScope, SearchKey, SearchPage, SearchQuery, PAGE_SIZE};
pub use forensics::{
    contract_stats, growth, round_numbers, split_detection, threshold_clustering, threshold_eras, ContractStats,
    RoundNumberCluster, SplitCluster, SupplierGrowth, ThresholdCluster, ThresholdEra, DEFAULT_TOP_N,
};

pub const CRATE_NAME: &str = "mof-analytics";
