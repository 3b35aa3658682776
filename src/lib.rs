//! Batched word-annotation pipeline: tokenize a text, split it into
//! word-count-bounded batches at natural breakpoints, annotate each batch
//! through an external LLM service, and merge everything into one
//! resumable word database.

pub mod config;
pub mod document;
pub mod pipeline;
pub mod progress;
pub mod service;
pub mod splitter;
pub mod stats;
pub mod tokenizer;
