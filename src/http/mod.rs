//! HTTP transport for the Model Context Protocol
//!
//! Serves the authenticated `/mcp` JSON-RPC endpoint plus public health and discovery routes.

pub mod handlers;
