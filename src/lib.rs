//! # Chat Archive
//!
//! A local, searchable archive of chat messages synchronized incrementally
//! from multiple chat services.
//!
//! Each run pulls only what is new per conversation (watermark-based
//! incremental sync), merges it idempotently into one SQLite archive and
//! isolates failures per conversation, so one broken conversation never
//! blocks its siblings and a retry is always safe.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │  Backends   │──▶│  Reconcile   │──▶│  SQLite  │
//! │ export/mem  │   │ per account  │   │ archive  │
//! └─────────────┘   └──────────────┘   └────┬─────┘
//!                                           │
//!                      ┌────────────────────┤
//!                      ▼                    ▼
//!                 ┌──────────┐        ┌───────────┐
//!                 │  search  │        │  unknown  │
//!                 │ +context │        │  senders  │
//!                 └──────────┘        └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! chat-archive init                    # create database
//! chat-archive sync                    # sync every configured account
//! chat-archive sync export:personal    # sync one account
//! chat-archive search hello alice -C 2
//! chat-archive unknown                 # conversations with unknown senders
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Backend and resolver error taxonomy |
//! | [`backend`] | Backend capability trait and adapters |
//! | [`reconcile`] | Idempotent per-account reconciliation |
//! | [`sync`] | Selector resolution and multi-account runs |
//! | [`unknown`] | Unknown-sender listing and resolution |
//! | [`search`] | Keyword search with context windows |
//! | [`render`] | Plain-text output |
//! | [`stats`] | Archive statistics |
//! | [`accounts`] | Configured accounts and their health |
//! | [`progress`] | Sync progress on stderr |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod accounts;
pub mod backend;
pub mod config;
pub mod db;
pub mod error;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod reconcile;
pub mod render;
pub mod search;
pub mod stats;
pub mod sync;
pub mod unknown;
