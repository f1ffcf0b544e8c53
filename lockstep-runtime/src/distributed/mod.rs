pub mod ekg;
pub mod master;
pub mod phase;
pub mod protocol;
pub mod worker;
