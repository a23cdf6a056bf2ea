pub(crate) mod hint;
pub mod num;
