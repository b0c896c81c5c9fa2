//! Model access: prompt templates, transports, and the structured
//! client that every stage calls through.

mod client;
mod template;
mod transport;

pub use client::{RetryPolicy, StructuredClient};
pub use template::PromptTemplate;
pub use transport::{HttpTransport, ModelTransport};
