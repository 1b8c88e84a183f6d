//! Observable types published by the session controller.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host UI can
//! forward them verbatim as JSON.

pub mod events;
