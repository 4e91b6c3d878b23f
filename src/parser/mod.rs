pub mod date;
pub mod release;
pub mod title;
