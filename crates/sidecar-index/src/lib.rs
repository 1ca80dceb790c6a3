//! sidecar-index: block indexing and the per-block pipeline.
//!
//! Fetches blocks through a [`sidecar_data::chain::ChainGateway`], keeps only
//! transactions touching configured protocol contracts, decodes their logs
//! against stored ABIs (following proxies), and feeds them to the state
//! models to produce a state root per block.

pub mod chain_tip;
pub mod contracts;
pub mod decoder;
pub mod fetcher;
pub mod indexer;
pub mod pipeline;
pub mod restaked_strategies;

pub use chain_tip::ChainTip;
pub use contracts::ContractResolver;
pub use decoder::{decode_log, DecodedLog};
pub use fetcher::{FetchedBlock, Fetcher};
pub use indexer::{IndexError, IndexErrorKind, Indexer, ParsedTransaction};
pub use pipeline::{BlockOutcome, Pipeline};
pub use restaked_strategies::{ReconcileSummary, RestakedStrategiesReconciler};
