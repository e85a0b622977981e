pub mod api;
pub mod cluster;
pub mod commit;
pub mod config;
pub mod conflict;
pub mod error;
pub mod interwiki;
pub mod rewrite;
pub mod runtime;
pub mod storage;
