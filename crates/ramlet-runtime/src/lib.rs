//! ramlet-runtime: Environment abstraction layer
//!
//! This crate provides the collaborators every ramlet component talks to:
//! - `Runtime`: starts, inspects and kills processes on nodes
//! - `Program`: a unit a runtime can execute
//! - `Oracle`: target-state and effect functions of the environment
//! - Bounded, FIFO port channels carrying serialized messages
//! - A simulated in-process environment with its built-in programs

pub mod ports;
pub mod programs;
pub mod rpc;
pub mod sim;
pub mod traits;
pub mod world;

pub use ports::{PortReader, PortRegistry};
pub use rpc::RpcContext;
pub use sim::SimRuntime;
pub use traits::{kill_and_wait, Oracle, ProcessContext, Program, Runtime, TargetState};
pub use world::SimWorld;
