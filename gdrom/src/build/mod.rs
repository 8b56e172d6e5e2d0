//! Disc image building.

pub mod gdrom;
pub mod iso;
