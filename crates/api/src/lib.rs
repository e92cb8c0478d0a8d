//! HTTP admin surface: routing and request/response mapping over the
//! process registry.

pub mod app;
