//! # Scratch Archive
//!
//! Timestamped snapshots of per-project knowledge directories, searchable
//! by keyword across projects, branches, and time.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌────────────┐   ┌──────────┐
//! │ workspace  │──▶│ SnapshotStore│──▶│ Extractor  │──▶│  SQLite  │
//! │ .giantmem/ │   │ {proj}/{ts}/ │   │ md + JSON  │   │   FTS5   │
//! └────────────┘   └──────┬───────┘   └────────────┘   └────┬─────┘
//!                         │                                  │
//!                  ┌──────┴──────┐                    ┌──────┴──────┐
//!                  │   dedup     │                    │   search    │
//!                  │  _review/   │                    │ + fallbacks │
//!                  └─────────────┘                    └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! sarc archive                  # snapshot ./.giantmem or ./scratch
//! sarc search "login bug" -p myrepo
//! sarc dedup myrepo --dry-run
//! sarc stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy and exit codes |
//! | [`models`] | Core data types |
//! | [`project`] | Project and branch inference |
//! | [`snapshot`] | Snapshot layout, creation, and `latest` pointers |
//! | [`extract`] | Document classification and record extraction |
//! | [`flatten`] | Dotted-path flattening of domain JSON |
//! | [`db`] | Database connection |
//! | [`migrate`] | Index schema |
//! | [`ingest`] | Index writer |
//! | [`queue`] | Background ingest dispatch |
//! | [`search`] | Ranked keyword search |
//! | [`fallback`] | Flat listings and index-free search |
//! | [`archive`] | The `archive` command |
//! | [`dedup`] | Dedup reconciler |
//! | [`stats`] | Index statistics |

pub mod archive;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod fallback;
pub mod flatten;
pub mod ingest;
pub mod listing;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod project;
pub mod queue;
pub mod search;
pub mod snapshot;
pub mod stats;
