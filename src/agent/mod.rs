//! Agent: asynchronous issue-to-PR and review-comment pipelines.
//!
//! ## Overview
//!
//! A client triggers a job over HTTP; the job runs on a background task in a
//! dedicated git worktree, invokes an external coding agent (an opaque CLI
//! such as `copilot`), commits and pushes the result and, for issues, opens
//! a pull request. The client polls the status endpoint to follow progress.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │ (mobile) │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘   poll   │         │                                        │
//!                       │         │ AgentRunner::start_issue/start_review  │
//!                       │         v                                        │
//!                       │  runner.rs  (AgentRunner, PipelineContext)       │
//!                       │         │                                        │
//!                       │         ├─ issue_pipeline.rs                     │
//!                       │         └─ review_pipeline.rs (DeletionDetector) │
//!                       │         │                                        │
//!                       │         │ CodingAgent::run()                     │
//!                       │         v                                        │
//!                       │  coding_agent.rs ─> process.rs ─> progress.rs    │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module      | Responsibility                                            |
//! |-------------|-----------------------------------------------------------|
//! | `models`    | `AgentJob`, `JobState`, request payloads                  |
//! | `status`    | `AgentStatusStore` + per-run `JobHandle`                  |
//! | `workspace` | worktree create/evict/remove, main-repo resolution        |
//! | `ids`       | `WorkspaceId` generator, `JobKind`                        |
//! | `git`       | typed `git` CLI calls                                     |
//! | `github`    | typed `gh` CLI calls (auth status, pr view, pr create)    |
//!
//! ## Job Lifecycle
//!
//! 1. `POST /api/agent/process` records a `pending` job synchronously, then
//!    spawns the pipeline.
//! 2. The pipeline marks the job `running` and updates its message at every
//!    step; meaningful agent output lines are published as they arrive.
//! 3. Whatever happens, the worktree is removed before the job is marked
//!    `completed` or `failed`.

pub mod api;
pub mod coding_agent;
pub mod git;
pub mod github;
pub mod ids;
pub mod issue_pipeline;
pub mod models;
pub mod process;
pub mod progress;
pub mod review_pipeline;
pub mod runner;
pub mod server;
pub mod status;
pub mod workspace;
