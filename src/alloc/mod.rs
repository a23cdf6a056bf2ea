pub mod bitvec;
mod block;
mod free_set;
pub mod manager;
pub mod manual;
pub mod page;
