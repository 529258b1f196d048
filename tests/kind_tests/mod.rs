//! Integration tests for kaas-conformance
//!
//! These tests run the real checks against a kind cluster and tell the story
//! of what a platform operator sees when the plugin inspects a stock
//! kubeadm-built control plane.
//!
//! # Test Organization
//!
//! - `harvest`: Stories about fetching kubelet configuration through the
//!   node proxy and reading it back from disk
//!
//! - `hardening`: Stories about the individual checks and a full suite run
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored --nocapture
//! ```

mod hardening;
mod harvest;
mod helpers;
