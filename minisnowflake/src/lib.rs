//! MiniSnowflake: a lightweight analytical SQL engine.
//!
//! Tables are sharded column-oriented files; queries execute map/reduce
//! style. The coordinator parses a statement, plans a per-shard map
//! query and an iterative reduce query, fans the map out over a dynamic
//! worker pool, and tree-reduces the partials into the final result.

pub mod backend;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod frontend;
pub mod net;
pub mod sharding;
pub mod worker;
