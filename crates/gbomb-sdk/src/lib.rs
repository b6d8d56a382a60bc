//! The legacy one-object Gbomb API.
//!
//! Kept for apps written against the original top-level SDK object. It
//! drives a [`gbomb_session::Session`] and sends requests through
//! [`gbomb_request::RequestConnection`].

pub mod delegate;
pub mod error;
pub mod gbomb;
pub mod request;

pub use delegate::{GbombRequestDelegate, GbombSessionDelegate};
pub use error::{Result, SdkError};
pub use gbomb::{Gbomb, GbombBuilder};
pub use request::{GbombRequest, RequestState};
