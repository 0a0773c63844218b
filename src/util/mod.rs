//! # Text and Domain Helpers
//!
//! Small pure helpers shared by handlers and jobs: email masking for
//! operator-visible output, widget-origin domain checks, route labels for
//! rate-limit tables, and lenient domain-name extraction.

pub mod domain;
pub mod email;
pub mod route;

pub use domain::{is_subdomain_or_domain, parse_domain_name};
pub use email::mask_email;
pub use route::route;
