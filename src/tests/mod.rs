//! Cross-module lifecycle tests.
//!
//! Unit tests live next to their modules; everything here exercises the
//! scheduler, orchestrator, executor, and store together against a
//! scripted agent.

mod lifecycle_tests;
