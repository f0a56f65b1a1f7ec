//! Locked, transactional access to the serialized backing file.

mod data_viewer;
mod guard;

pub use data_viewer::DataViewer;
