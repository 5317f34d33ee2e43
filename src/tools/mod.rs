pub mod catalog;
pub mod executor;
pub mod mcp;
pub mod memory;
pub mod transport;

pub use catalog::{normalize_schema, CatalogError, InputSchema, ModelToolSpec, ToolCatalog};
pub use executor::{OutcomeKind, ToolExecutor, ToolOutcome};
pub use mcp::McpStdioTransport;
pub use memory::InMemoryTransport;
pub use transport::{CallToolResult, ToolContent, ToolDescriptor, ToolTransport, TransportError};
