pub mod grid;
pub mod list;
pub mod run;
