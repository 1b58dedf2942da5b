//! Upstream query client, raw-response archive and the relational store for MOF.

pub mod archive;
pub mod client;
pub mod store;

pub use archive::{ArchivedResponse, ResponseArchive};
pub use client::{
    decode_envelope, encode_envelope, FetchedRows, PagedRows, QueryClient, QueryClientConfig, Record, ReqwestTransport,
    RetryPolicy, ServiceError, StatusCode, Transport, TransportError, TransportResponse,
};
pub use store::{
    AmountBound, AmountBounds, AreaAttribute, Batch, BatchWrite, ContractFilter, ContractPage, Purge, RecordTable,
    SearchSort, Store, StoreError, StoreResult,
};

pub const CRATE_NAME: &str = "mof-storage";
