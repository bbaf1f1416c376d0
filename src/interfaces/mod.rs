//! Edges of the engine: CSV files and the JSON-lines command script.

pub mod csv;
pub mod script;
