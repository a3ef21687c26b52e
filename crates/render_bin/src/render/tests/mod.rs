//! Whole-bin tests driven through the message bus and a recording device

mod fixtures;

mod bin_properties;
mod concurrency;
mod message_flow;
