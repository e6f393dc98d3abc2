//! # Caravel Bundle
//!
//! The bundle data model for the Caravel DTN daemon.
//!
//! A bundle is the unit of store-and-forward transfer in a delay-tolerant
//! network: a primary block with routing metadata (source, destination,
//! creation timestamp, lifetime, flags) followed by canonical blocks, one of
//! which carries the payload. Large payloads may travel as fragments, each a
//! bundle of its own that shares the group identity and adds a byte offset.
//!
//! This crate defines the value types shared by the storage engine and its
//! networking/routing collaborators:
//!
//! - [`EndpointId`]: `dtn://node/application` endpoint identifiers
//! - [`BundleId`]: the (source, timestamp, sequence, fragment offset) identity
//! - [`Bundle`], [`Block`], [`PrimaryBlock`]: the bundle itself
//! - [`BundleMeta`]: the payload-free metadata view used by index lookups
//!
//! Wire encoding is postcard over the serde derives; [`Bundle::to_wire`] and
//! [`Bundle::from_wire`] are the durable representation used by the store.

pub mod bundle;
pub mod endpoint;
pub mod error;
pub mod id;
pub mod meta;

pub use bundle::{BLOCK_PAYLOAD, Block, Bundle, PrimaryBlock, Priority, ProcessingFlags};
pub use endpoint::EndpointId;
pub use error::{BundleError, BundleResult};
pub use id::BundleId;
pub use meta::BundleMeta;
