//! Terminal output shared by the `citemetrics` binaries.

pub mod output;
