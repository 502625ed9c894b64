pub mod api;
pub mod assistant;
pub mod browse;
pub mod compiler;
pub mod error;
pub mod llm;
pub mod prompts;
pub mod rule_store;
pub mod safety;
pub mod sampler;
pub mod schema;
pub mod session;
pub mod store;
pub mod suggest;
pub mod validator;
