//! Configuration and data model
//!
//! Container types, engine settings, and spec validation.

pub mod engine;
pub mod types;
pub mod validator;
