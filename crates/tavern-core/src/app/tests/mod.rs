//! Conversation tests module.
//!
//! Property tests over randomly shaped message trees: tree building, latest
//! path selection and sibling navigation.
