//! Small shared helpers used across the nsq crates: debug-strict /
//! release-tolerant invariant assertions (`safe_panic!` and friends).

mod assert;
