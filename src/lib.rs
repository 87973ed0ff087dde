//! # Mailflow
//!
//! An adaptive analysis pipeline that turns raw email chains into structured
//! workflow intelligence.
//!
//! Mailflow ingests email exports into SQLite, groups them into conversation
//! chains, scores each chain's completeness, and routes every email through
//! one, two, or three analysis phases depending on how much signal the chain
//! carries. Phase 1 is pure local extraction; phases 2 and 3 call an external
//! language-model provider and merge its output additively into the phase-1
//! baseline. Batch runs checkpoint their progress and resume after
//! interruption without reprocessing committed work.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌─────────────┐   ┌──────────┐
//! │  JSONL   │──▶│ Chains +   │──▶│ Phase router │──▶│  SQLite   │
//! │  ingest  │   │ scoring    │   │ 1 / 2 / 3    │   │ analysis  │
//! └──────────┘   └────────────┘   └──────┬──────┘   └──────────┘
//!                                        │
//!                                        ▼
//!                                 ┌─────────────┐
//!                                 │ Enrichment  │
//!                                 │ gateway     │
//!                                 └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! mfl init                          # create database
//! mfl ingest emails.jsonl           # seed items
//! mfl analyze                       # run the pipeline
//! mfl stats                         # coverage summary
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`chains`] | Chain derivation from items |
//! | [`completeness`] | Chain completeness scoring and classification |
//! | [`extract`] | Phase-1 local entity extraction |
//! | [`router`] | Phase selection per item |
//! | [`enrich`] | External enrichment gateway (phases 2 and 3) |
//! | [`parse`] | Tolerant parsing of enrichment responses |
//! | [`merge`] | Additive merging of enrichment output |
//! | [`pipeline`] | Resumable batch orchestration |
//! | [`store`] | Transactional persistence |
//! | [`checkpoint`] | Durable run checkpoints |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chains;
pub mod checkpoint;
pub mod completeness;
pub mod config;
pub mod db;
pub mod enrich;
pub mod extract;
pub mod ingest_jsonl;
pub mod merge;
pub mod migrate;
pub mod models;
pub mod parse;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod router;
pub mod stats;
pub mod store;
