pub mod identity;
pub mod logbook;
