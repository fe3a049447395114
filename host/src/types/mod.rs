//! Common types.

pub mod l2cap;
pub(crate) mod primitives;
