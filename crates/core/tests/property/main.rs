//! Property-based tests for the consent invariants.
//!
//! ```bash
//! cargo test -p consent-core --test property
//! PROPTEST_CASES=512 cargo test -p consent-core --test property
//! ```

mod expiry;
mod grant;
mod support;
mod transfer;
