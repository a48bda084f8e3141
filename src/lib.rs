#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;

pub mod alias;
pub use alias::{AliasKind, BuildAlias};

pub mod contracts;

pub mod registry;
pub use registry::{BuildOptions, Registry};

pub mod model;

pub mod unit;
pub use unit::{expand_module, Unit};

pub mod unity;
pub use unity::UnityPlan;

pub mod actions;
pub use actions::{generate_target_actions, Action, TargetActions};

pub mod cache;
pub use cache::ActionCache;

pub mod graph;
pub use graph::{BuildContext, Buildable, Graph};

pub mod exec;
pub use exec::ExecutionEngine;

pub mod compile_commands;

pub mod cli;
