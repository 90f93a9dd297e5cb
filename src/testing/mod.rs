//! Test doubles shared across module tests.

mod fake_store;

pub(crate) use fake_store::FakeStore;
