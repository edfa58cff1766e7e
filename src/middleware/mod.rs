//! Request middleware wrapped around the distribution endpoints.

pub mod blob;
pub mod timing;
