//! Sandbox subsystem: remote code execution for chat sessions.
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `client`      | `SandboxService` trait + REST client for the hosted service |
//! | `registry`    | session → sandbox resolution (cache, single-flight)     |
//! | `interpreter` | `evaluate_code` / `run_fragment` result envelopes       |
//!
//! The remote service owns sandbox lifetimes (they self-expire after
//! their timeout); this subsystem only decides when to create, reconnect
//! to, or kill one.

pub mod client;
pub mod interpreter;
pub mod registry;

pub use client::{E2bClient, Execution, ExecutionError, FileNode, SandboxHandle, SandboxService};
pub use interpreter::{evaluate_code, run_fragment, EvaluateResult, ExecutionResult, Fragment};
pub use registry::SessionRegistry;
