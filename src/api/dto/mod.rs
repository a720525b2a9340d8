//! Data Transfer Objects for REST request/response serialization.

pub mod reference_dto;
pub mod status_dto;

pub use reference_dto::*;
pub use status_dto::*;
