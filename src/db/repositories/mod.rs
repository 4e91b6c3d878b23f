pub mod release;
pub mod source;
pub mod work;
