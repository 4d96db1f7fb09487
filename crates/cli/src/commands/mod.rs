pub mod agent;
pub mod mcp;
