//! Utility functions for liegroup-embed

pub mod linalg;
