//! The Gofer run-execution core.
//!
//! Gofer is a container-native job orchestrator: users declare pipelines made of containerized
//! tasks with inter-task dependencies and Gofer drives each run through validation, scheduling,
//! execution, and completion while emitting a durable event stream.
//!
//! This crate contains everything below the transport layer: the storage contract, the object and
//! secret stores, the scheduler interface (plus the docker implementation), the eventbus, the
//! pipeline service, the run orchestrator, and the extension host. RPC/HTTP wrappers mount on top
//! of [`api::Api`].

pub mod api;
pub mod conf;
pub mod object_store;
pub mod scheduler;
pub mod secret_store;
pub mod storage;
