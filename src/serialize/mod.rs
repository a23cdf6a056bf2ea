pub mod serde_nanos;
