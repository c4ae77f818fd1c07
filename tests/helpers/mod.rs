#![allow(dead_code)]

pub mod blobs;
pub mod builders;
pub mod db;

pub use blobs::{BlobCall, RecordingBlobStore};
pub use builders::{ClientBuilder, EngagementBuilder, TestFirm, UserBuilder};
pub use db::TestDb;
