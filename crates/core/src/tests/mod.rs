//! Cross-component scenario tests.

mod test_persistence;
mod test_rollback;
