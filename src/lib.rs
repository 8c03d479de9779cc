//! Declarative provisioning reconciler for TOSCA/Cloudify-style blueprints.
//!
//! A blueprint is loaded and merged with its imports ([`compiler::loader`]),
//! turned into an ordered dependency graph ([`compiler::core`]) and driven
//! through its lifecycle by the [`runtime::engine::Engine`], which delegates
//! every resource operation to a [`providers::ProviderAdapter`].

pub mod config;
pub mod compiler;
pub mod dsl;
pub mod error;
pub mod providers;
pub mod runtime;
