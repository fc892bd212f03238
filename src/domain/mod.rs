//! Domain layer: data model, configuration, and the note container codecs.

pub mod compression;
pub mod legacy;
pub mod models;
pub mod settings;
pub mod strokes;
