//! docvault: a multi-tenant document vault for accounting firms.
//!
//! Firms are the tenant boundary. Staff see only the clients and engagements
//! they are assigned to; admins and managers see their whole firm. Every
//! sensitive action leaves an audit row.

pub mod assignments;
pub mod audit;
pub mod blob;
pub mod clients;
pub mod documents;
pub mod entities;
pub mod errors;
pub mod jobs;
pub mod page;
pub mod policy;
pub mod rate_limit;
pub mod seed;
pub mod session;
pub mod settings;
pub mod storage;
pub mod web;
