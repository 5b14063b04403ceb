//! # greedy-infomax-rs
//!
//! Greedy layer-wise self-supervised representation learning for raw 1-D
//! signals (Greedy InfoMax), with a variational latent per time step.
//!
//! A stack of modules is trained without end-to-end backpropagation. Every
//! module encodes its input into a Gaussian per step, samples latents,
//! optionally summarizes them with a causal GRU, and minimizes its own
//! InfoNCE loss plus a small KL penalty. The latent handed to the next module
//! is severed from the graph, so each module is optimized independently.
//!
//! ## Features
//!
//! - **Variational encoder** - strided convolutions emitting mean and log-variance
//! - **InfoNCE objective** - multi-offset prediction with excluded-positive negatives
//! - **Greedy stacking** - explicit [`sever_gradient`] boundary between modules
//! - **Seeded execution** - all randomness flows through [`ExecutionContext`]
//! - **YAML configuration** - presets for CPC and three-module GIM schedules
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a preset configuration
//! gim init gim.yaml --preset gim
//!
//! # Check the schedule against the sequence length
//! gim validate gim.yaml
//!
//! # Train on synthetic signals
//! gim train gim.yaml --synthetic 256
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```rust
//! use greedy_infomax_rs::{ExecutionContext, GimConfig, ModuleStack};
//!
//! # fn main() -> greedy_infomax_rs::Result<()> {
//! let config = GimConfig::test();
//! let mut ctx = ExecutionContext::cpu(config.seed);
//! let stack = ModuleStack::new(&config, &ctx)?;
//!
//! let signals = ctx.standard_normal((4, 1, config.data.sequence_length))?;
//! let output = stack.forward(&signals, &mut ctx)?;
//! for (idx, (loss, accuracy)) in output.losses()?.iter().enumerate() {
//!     println!("module {}: loss {loss:.4}, accuracy {accuracy:.3}", idx + 1);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod aggregator;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod contrastive;
pub mod data;
pub mod encoder;
pub mod error;
pub mod latent;
pub mod module;
pub mod optimizer;
pub mod probe;
pub mod stack;
pub mod trainer;

pub use config::{GimConfig, LossConfig, ModuleConfig};
pub use context::ExecutionContext;
pub use contrastive::{ContrastiveObjective, NegativeSampleSet};
pub use error::{GimError, Result};
pub use module::{GreedyModule, ModuleOutput};
pub use probe::LinearProbe;
pub use stack::{sever_gradient, ModuleStack, StackOutput};
pub use trainer::{EpochMetrics, GreedyTrainer, ModuleMetrics};
