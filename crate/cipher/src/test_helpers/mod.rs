//! Helpers driving the block ciphers end to end in tests.

pub mod ff1;

pub use ff1::Ff1;
