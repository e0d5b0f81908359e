//! End-to-end scenarios with literal values.
