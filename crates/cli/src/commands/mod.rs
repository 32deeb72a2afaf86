pub mod migrate;
pub mod parse;
pub mod status;
