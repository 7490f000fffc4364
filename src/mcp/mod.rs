//! Protocol layer: message types, the newline-framed codec and the server dispatcher

pub mod codec;
pub mod dispatcher;
pub mod types;
