//! # Sandbox Harness
//!
//! **A kernel-backed tool bridge with persistent knowledge retrieval for AI
//! coding agents.**
//!
//! The harness gives an agentic client three capabilities over one tool
//! API: run code in an isolated kernel that keeps variable state between
//! calls, fetch and semantically search documentation without the content
//! entering the agent's context, and run bounded sub-agent loops that may
//! call the kernel and a sub-language-model.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐  tools   ┌──────────────┐  HTTP   ┌─────────┐
//! │ Client │─────────▶│  Tool server │────────▶│ Kernel   │
//! └────────┘          │  (dispatch)  │◀────────│ (code)   │
//!                     └──┬───────┬───┘ callback└─────────┘
//!                        ▼       ▼
//!                 ┌──────────┐ ┌──────────┐
//!                 │ Knowledge │ │ Fetcher  │
//!                 │ (SQLite)  │ │ (cascade)│
//!                 └──────────┘ └──────────┘
//! ```
//!
//! ## Data flow
//!
//! 1. The client calls a named tool; arguments are validated against the
//!    tool's schema ([`tools`]).
//! 2. Kernel tools route through the [`kernel_manager`] (lazy start, health
//!    loop) to the [`kernel_client`].
//! 3. Knowledge tools hit a per-project [`store`] with FTS5 + vector
//!    retrieval fused by reciprocal rank.
//! 4. Fetch tools run the three-tier markdown [`fetch`] cascade with a
//!    freshness-checked raw cache.
//! 5. `sub_agent` drives the bounded loop in [`subagent`]; code it executes
//!    can call back into host tools via the loopback [`callback`] server.
//! 6. Kernel state is periodically snapshotted per session ([`snapshot`]).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Normalized error kinds shared by every tool |
//! | [`models`] | Core data types: documents, chunks, hits, usage |
//! | [`project`] | Project identity and the per-project store registry |
//! | [`db`] | Per-project SQLite pool with WAL mode |
//! | [`migrate`] | Index schema migrations (idempotent) |
//! | [`chunk`] | Markdown-section chunker with neighbor merging |
//! | [`embedding`] | Embedding provider trait and vector utilities |
//! | [`store`] | Knowledge store: ingest, hybrid search, ask, timeline |
//! | [`fetch`] | Markdown cascade, blocklist, raw cache, sitemaps |
//! | [`kernel_client`] | Typed HTTP client for the kernel contract |
//! | [`kernel_manager`] | Kernel lifecycle: tiers, lazy start, health |
//! | [`snapshot`] | Session snapshot save/restore |
//! | [`llm`] | Language-model providers (main and sub model) |
//! | [`subagent`] | Signatures, bounded loop, helper injection |
//! | [`callback`] | Loopback server for kernel-originated calls |
//! | [`research`] | Topic research orchestration |
//! | [`tools`] | The fixed tool surface and argument validation |
//! | [`server`] | Client-facing HTTP tool API |
//! | [`host`] | Lifecycle composition and shutdown ordering |

pub mod callback;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod fetch;
pub mod host;
pub mod kernel_client;
pub mod kernel_manager;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod project;
pub mod research;
pub mod server;
pub mod snapshot;
pub mod store;
pub mod subagent;
pub mod tools;
