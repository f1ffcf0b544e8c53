pub mod distributed;
pub mod load;
pub mod observability;
pub mod persist;
pub mod programs;
pub mod shuffle;
