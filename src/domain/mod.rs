//! Splunk and APM domain logic exposed as MCP tools
//!
//! `splunk` and `traces` normalize upstream payloads into stable records, `tools` maps tool
//! calls onto them, and `utils` holds the shared decode-with-default helpers.

pub mod splunk;
pub mod tools;
pub mod traces;
pub mod utils;
