//! Service layer: allocation, publication and request orchestration.
//!
//! [`StatusListService`] is the entry point used by the API. Per pool it
//! drives an [`IndexAllocator`], a [`PrecreationScheduler`] and a
//! [`PoolWriter`]; verifier reads go through the shared
//! [`StatusListCache`]. All of them report through the
//! [`super::domain::EventBus`].

pub mod index_allocator;
pub mod pool_writer;
pub mod precreation;
pub mod signer;
pub mod status_list_cache;
pub mod status_list_service;

pub use index_allocator::{AllocatorState, IndexAllocator};
pub use pool_writer::PoolWriter;
pub use precreation::PrecreationScheduler;
pub use signer::{Ed25519JwtSigner, SharedSigner, TokenSigner};
pub use status_list_cache::{CachedList, StatusListCache};
pub use status_list_service::StatusListService;
