//! convoy controller library
//!
//! Continuously renders kustomize overlays from fetched source snapshots,
//! applies the result to the cluster and prunes what is no longer declared.
//!
//! ## Pipeline
//!
//! ```text
//! source snapshot ─▶ overlay ─▶ build ─▶ substitute ─▶ token
//!                                  ▲                      │
//!                                  └──── stamp token ◀────┘
//!                ─▶ validate ─▶ apply ─▶ prune ─▶ health ─▶ status
//! ```
//!
//! ## Modules
//!
//! - `api`: the Kustomization type, conditions and label keys
//! - `cluster`: generic cluster API seam and its in-memory implementation
//! - `source`: source resolution and artifact fetching
//! - `overlay`: build configuration synthesis in the staging area
//! - `build`: build engine adapters
//! - `render`: the two-pass build producing the generation token
//! - `apply`: validation, apply and prune
//! - `dependency`, `health`: gates around apply
//! - `reconciler`: the per-object state machine
//! - `controller`: work queue, workers and resync

pub mod api;
pub mod apply;
pub mod build;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod dependency;
pub mod health;
pub mod overlay;
pub mod reconciler;
pub mod render;
pub mod source;
