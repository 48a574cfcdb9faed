//! Core engine: recipe model, parsing, graph, scheduling, execution.

pub mod cache;
pub mod condition;
pub mod config;
pub mod executor;
pub mod graph;
pub mod hasher;
pub mod parser;
pub mod runner;
pub mod scheduler;
pub mod template;
pub mod types;
